//! Per-request identity/trace context, layered on top of the verified JWT.
//! Grounded on `common/security/src/context.rs`'s `SecurityCtxExtractor`:
//! same header-parsing and fresh-trace-id-fallback idiom, adapted for a
//! service with no tenant axis — `uid`/`roles` come from the already
//! verified `AuthContext` rather than an unauthenticated header.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use common_auth::{AuthContext, JwtVerifier};
use tracing::Span;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub uid: Uuid,
    pub roles: Vec<String>,
    pub trace_id: Uuid,
}

impl RequestContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    Arc<JwtVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = <AuthContext as FromRequestParts<S>>::Rejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthContext::from_request_parts(parts, state).await?;

        let trace_id = parts
            .headers
            .get("X-Trace-ID")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        Span::current().record("uid", tracing::field::display(auth.claims.subject));
        Span::current().record("trace_id", tracing::field::display(trace_id));

        Ok(Self {
            uid: auth.claims.subject,
            roles: auth.claims.roles.clone(),
            trace_id,
        })
    }
}
