use axum::http::HeaderMap;
use outpost_core::models::NodeId;
use outpost_core::sync::NodeRegistry;

use crate::error::AppError;

/// Node identity taken from a verified bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedNode {
    pub node_id: NodeId,
    pub code: String,
    /// Raw token, re-checked against the node table by the hub
    pub token: String,
}

/// Check the token signature and expiry without touching the database.
pub fn verify_bearer(registry: &NodeRegistry, headers: &HeaderMap) -> Result<AuthenticatedNode, AppError> {
    let token = extract_bearer_token(headers).inspect_err(|error| {
        tracing::warn!(target: "outpost::security", "Rejected request: {error}");
    })?;
    let claims = registry.verify_token(token).inspect_err(|error| {
        tracing::warn!(target: "outpost::security", "Rejected node token: {error}");
    })?;
    Ok(AuthenticatedNode {
        node_id: claims.node_id()?,
        code: claims.code,
        token: token.to_string(),
    })
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn bearer_token_extractor_rejects_empty_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer   "));
        assert!(extract_bearer_token(&headers).is_err());
        assert!(extract_bearer_token(&HeaderMap::new()).is_err());
    }
}
