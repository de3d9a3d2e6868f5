//! Permission-scoped claim extractors, one per resource area, so a handler
//! only has to name the scope it needs and axum rejects everything else.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use crate::error::ControlPlaneError;
use crate::token::{AccessClaims, TokenService};

/// Extracts and validates the bearer token, making the full claim set
/// available to a handler that needs more than one permission.
#[derive(Clone)]
pub struct BearerClaims(pub AccessClaims);

impl<S> FromRequestParts<S> for BearerClaims
where
    S: Send + Sync,
    std::sync::Arc<TokenService>: axum::extract::FromRef<S>,
{
    type Rejection = ControlPlaneError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .map_err(|_| ControlPlaneError::authentication("missing or malformed Authorization header"))?;

        let token_service = <std::sync::Arc<TokenService> as axum::extract::FromRef<S>>::from_ref(state);
        let claims = token_service.validate(bearer.token()).await?;

        Ok(Self(claims))
    }
}

macro_rules! permission_scope {
    ($name:ident, $permission:literal) => {
        #[derive(Clone)]
        pub struct $name(pub AccessClaims);

        impl<S> FromRequestParts<S> for $name
        where
            S: Send + Sync,
            std::sync::Arc<TokenService>: axum::extract::FromRef<S>,
        {
            type Rejection = ControlPlaneError;

            async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
                let BearerClaims(claims) = BearerClaims::from_request_parts(parts, state).await?;
                if claims.has_permission($permission) {
                    Ok(Self(claims))
                } else {
                    Err(ControlPlaneError::authorization(concat!("token lacks the '", $permission, "' permission")))
                }
            }
        }
    };
}

permission_scope!(ConnectScope, "connect");
permission_scope!(TunnelScope, "tunnel");
permission_scope!(RouteScope, "route");
permission_scope!(HeadendScope, "headend");
permission_scope!(ProxyScope, "proxy");
permission_scope!(WireGuardScope, "wireguard");
permission_scope!(MirrorTrafficScope, "mirror_traffic");

/// Gates the admin surface (`/api/v1/admin/*`). The web UI's own session
/// model is out of scope; a bearer token carrying this permission stands
/// in for it (SPEC_FULL.md §6).
permission_scope!(AdminScope, "admin");
