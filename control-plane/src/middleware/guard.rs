use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ControlPlaneError;
use crate::guard::{ClientIp, RequestGuard};

pub async fn guard_middleware(
    State(guard): State<Arc<RequestGuard>>,
    client_ip: ClientIp,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ControlPlaneError> {
    let path = request.uri().path().to_owned();
    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let decision = guard.check(&path, client_ip.0);

    if !decision.allowed {
        if decision.emergency {
            return Err(ControlPlaneError::unavailable("service is in emergency mode, rejecting non-essential traffic"));
        }
        let retry_after = decision.retry_after_secs.unwrap_or(60);
        return Err(ControlPlaneError::rate_limited("too many requests", retry_after));
    }

    guard.inspect_anomalies(&path, user_agent.as_deref(), client_ip.0);

    Ok(next.run(request).await)
}
