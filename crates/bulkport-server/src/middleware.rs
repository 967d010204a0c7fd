use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use bulkport_api::ApiError;

use crate::config::AuthConfig;

// =============================================================================
// Authentication Middleware
// =============================================================================

/// Identity of an authenticated caller, available to handlers as a request
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub tenant_id: String,
    pub user_id: Option<String>,
}

/// Static bearer tokens and the identities they stand for.
#[derive(Debug, Default)]
pub struct AuthTokens {
    tokens: HashMap<String, AuthData>,
}

impl AuthTokens {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let tokens = cfg
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    AuthData {
                        tenant_id: t.tenant_id.clone(),
                        user_id: t.user_id.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn resolve(&self, token: &str) -> Option<&AuthData> {
        self.tokens.get(token)
    }
}

/// Resolves the Bearer token into [`AuthData`] and stores it in request
/// extensions. Missing or unknown tokens get a 401 OperationOutcome.
pub async fn authentication_middleware(
    State(tokens): State<Arc<AuthTokens>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(auth_header) = req.headers().get(AUTHORIZATION).and_then(|h| h.to_str().ok()) else {
        tracing::debug!(path = %req.uri().path(), "No Authorization header");
        return ApiError::unauthorized("Authentication required").into_response();
    };

    let token = match auth_header.strip_prefix("Bearer ") {
        Some(t) if !t.is_empty() => t,
        _ => return ApiError::unauthorized("Invalid Authorization header format").into_response(),
    };

    match tokens.resolve(token) {
        Some(auth) => {
            tracing::debug!(tenant_id = %auth.tenant_id, "Token validated");
            req.extensions_mut().insert(auth.clone());
            next.run(req).await
        }
        None => {
            tracing::debug!("Unknown bearer token");
            ApiError::unauthorized("Invalid or expired token").into_response()
        }
    }
}

// =============================================================================
// Other Middleware
// =============================================================================

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

// Ensures each request has an X-Request-Id and mirrors it on the response
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let req_id_value = req
        .headers()
        .get(&REQUEST_ID)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    // Kept in extensions for the request span
    if let Some(value) = &req_id_value {
        req.extensions_mut().insert(value.clone());
    }

    let mut res = next.run(req).await;
    if let Some(value) = req_id_value {
        res.headers_mut().insert(REQUEST_ID, value);
    }
    res
}
