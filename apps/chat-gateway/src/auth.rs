//! Bearer-token authentication extractor (§6.1) and the `X-Request-ID`
//! propagation middleware, mirroring `ingress-common`'s
//! `with_request_id`/`verify_bearer` shape but against the identity
//! verifier instead of a static shared secret.

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode, request::Parts};
use axum::middleware::Next;
use axum::response::Response;
use chat_core::{AuthContext, ChatError};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const TENANT_OVERRIDE_HEADER: &str = "x-tenant-id";

pub async fn with_request_id(mut req: Request<Body>, next: Next) -> Response {
    let rid = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(rid.clone()));

    let mut res = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        res.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    res
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Extracts and verifies the bearer token, applying the `X-Tenant-ID`
/// override (§6.1 "Optional `X-Tenant-ID` overrides the token's tenant for
/// the call").
pub struct Authenticated(pub AuthContext);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let tenant_override = parts
            .headers
            .get(TENANT_OVERRIDE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let state = state.clone();

        async move {
            let header = header.ok_or(ChatError::Unauthorized)?;
            let token = header.strip_prefix("Bearer ").ok_or(ChatError::Unauthorized)?;
            let mut ctx = state.verifier.verify(token).await.map_err(|_| ChatError::Unauthorized)?;
            if let Some(tenant) = tenant_override {
                ctx.tenant_id = Some(tenant);
            }
            state.store.upsert_directory_entry(&ctx).await.ok();
            Ok(Authenticated(ctx))
        }
    }
}

/// Rate-limit middleware (§5): applied ahead of auth so an attacker can't
/// dodge the budget by sending invalid tokens.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let addr = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or_else(|| std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    if !state.rate_limiter.check(addr) {
        return Err(ApiError(ChatError::RateLimited));
    }
    Ok(next.run(req).await)
}

pub fn unauthorized() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

/// Request handlers inherit a deadline; a handler still running past it
/// surfaces `SERVICE_UNAVAILABLE` rather than hanging the connection (§5).
pub async fn request_deadline(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let deadline = std::time::Duration::from_secs(state.config.request_deadline_secs);
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(res) => Ok(res),
        Err(_) => Err(ApiError(ChatError::ServiceUnavailable {
            message: "request exceeded its deadline".into(),
        })),
    }
}
