//! Outermost filter in the chain, sorted at `order::MIN` so it wraps every
//! other filter the way the rest of the onion wraps the business handler
//! (§4.4): it calls `chain.next` first, then renders whatever the nested
//! call produced -- success or error -- into exactly one `ResponseEnvelope`
//! on `ctx.response_envelope`. Neither transport builds a response body
//! itself any more; both just read this field back.

use async_trait::async_trait;
use p256::ecdsa::SigningKey;

use crate::context::RequestContext;
use crate::envelope::{self, Plan, PlanKeys};
use crate::error::{GatewayError, Result};
use crate::filter::{order, Filter, FilterChain};

pub struct RenderHandleFilter {
    standalone_sign_key: Vec<u8>,
    /// Signs the `e` provenance field on `Login` route responses so a
    /// client can verify the response actually came from this gateway
    /// instance, not just from someone holding the handshake secret.
    ecdsa_signing_key: SigningKey,
}

impl RenderHandleFilter {
    pub fn new(standalone_sign_key: Vec<u8>, ecdsa_signing_key: SigningKey) -> Self {
        RenderHandleFilter { standalone_sign_key, ecdsa_signing_key }
    }

    fn plan_for(route_config: &crate::router::RouterConfig) -> Plan {
        if route_config.login {
            Plan::Handshake
        } else if route_config.aes_response {
            Plan::AesGcm
        } else {
            Plan::Plain
        }
    }
}

#[async_trait]
impl Filter for RenderHandleFilter {
    fn name(&self) -> &str {
        "render_handle"
    }

    fn order(&self) -> i32 {
        order::MIN
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        let outcome = chain.next(ctx, cursor).await;

        let nonce = ctx.attr("nonce").map(str::to_string);
        let plan = Self::plan_for(&ctx.route_config);
        let keys = PlanKeys {
            token_secret: ctx.token_secret.as_ref(),
            handshake_secret: ctx.handshake_secret.as_deref(),
            standalone_sign_key: &self.standalone_sign_key,
            trusted_ecdsa_keys: &[],
            trusted_rsa_keys: &[],
            guest: ctx.route_config.guest,
        };

        // Only `Login` responses carry a provenance signature: it is how a
        // caller doing the plan=2 handshake confirms the response came from
        // this gateway's key, not just from whoever holds the handshake
        // secret.
        let sign_ecdsa = ctx.route_config.login.then_some(&self.ecdsa_signing_key);

        let envelope = match outcome {
            Ok(()) => render_success(&ctx.response_body, nonce.as_deref(), plan, &keys, sign_ecdsa),
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, path = %ctx.path, error = %e, "request rejected");
                render_error(&e, nonce.as_deref(), plan, &keys, sign_ecdsa)
            }
        };
        tracing::trace!(path = %ctx.path, status = envelope.c, "render complete");
        ctx.response_envelope = Some(envelope);
        Ok(())
    }
}

fn render_success(
    body: &[u8],
    nonce: Option<&str>,
    plan: Plan,
    keys: &PlanKeys<'_>,
    sign_ecdsa: Option<&SigningKey>,
) -> envelope::ResponseEnvelope {
    envelope::encode_response(200, "ok", body, nonce, None, plan, keys, sign_ecdsa, None)
        .unwrap_or_else(|e| render_error(&e, nonce, plan, keys, sign_ecdsa))
}

/// A failure during the chain (or during success rendering itself) still
/// needs a signed envelope when a secret is available, since a caller that
/// never got to the point of a handshake secret (e.g. `Unauthenticated`
/// itself) can't verify one anyway; `plain_error_envelope` is the fallback
/// for exactly that case.
fn render_error(
    err: &GatewayError,
    nonce: Option<&str>,
    plan: Plan,
    keys: &PlanKeys<'_>,
    sign_ecdsa: Option<&SigningKey>,
) -> envelope::ResponseEnvelope {
    let status = err.status_code();
    let message = err.to_string();
    envelope::encode_response(status, &message, b"", nonce, None, plan, keys, sign_ecdsa, None)
        .unwrap_or_else(|_| envelope::plain_error_envelope(status, &message, nonce))
}
