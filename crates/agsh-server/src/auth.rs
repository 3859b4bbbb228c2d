//! Caller identity from trusted reverse-proxy headers.
//!
//! The engine never authenticates anyone itself: the fronting proxy
//! verifies the user and injects identity headers on every request. A
//! configurable fallback identity keeps local development working without
//! a proxy; it is off by default.

use axum::http::HeaderMap;

use agsh_core::{AgshError, AgshResult};

pub const USER_HEADER: &str = "x-forwarded-user";
pub const ACCESS_TOKEN_HEADER: &str = "x-forwarded-access-token";

/// Identity of the calling user as asserted by the proxy.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user: String,
    /// Per-user upstream token, forwarded into spawned environments by
    /// deployments that need it.
    pub access_token: Option<String>,
}

/// Extract the caller identity, falling back to the configured development
/// identity when the proxy header is absent.
pub fn caller_identity(
    headers: &HeaderMap,
    dev_fallback: Option<&str>,
) -> AgshResult<CallerIdentity> {
    let user = header_value(headers, USER_HEADER)
        .or_else(|| dev_fallback.map(str::to_string))
        .ok_or_else(|| AgshError::Unauthenticated(format!("missing {USER_HEADER} header")))?;

    Ok(CallerIdentity {
        user,
        access_token: header_value(headers, ACCESS_TOKEN_HEADER),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_identity_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, "alice@example.com".parse().unwrap());
        headers.insert(ACCESS_TOKEN_HEADER, "tok-123".parse().unwrap());
        let identity = caller_identity(&headers, Some("dev@local")).unwrap();
        assert_eq!(identity.user, "alice@example.com");
        assert_eq!(identity.access_token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn fallback_applies_without_header() {
        let identity = caller_identity(&HeaderMap::new(), Some("dev@local")).unwrap();
        assert_eq!(identity.user, "dev@local");
        assert!(identity.access_token.is_none());
    }

    #[test]
    fn missing_identity_is_unauthenticated() {
        let err = caller_identity(&HeaderMap::new(), None).unwrap_err();
        assert!(matches!(err, AgshError::Unauthenticated(_)));
    }

    #[test]
    fn empty_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, "".parse().unwrap());
        let err = caller_identity(&headers, None).unwrap_err();
        assert!(matches!(err, AgshError::Unauthenticated(_)));
    }
}
