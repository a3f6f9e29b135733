use anyhow::{bail, Result};
use http::header::AUTHORIZATION;
use http::HeaderMap;

/// Shared secret that mutating endpoints require as `Authorization: Bearer <token>`.
#[derive(Clone)]
pub(crate) struct AuthToken {
    token: String,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken").field("token", &"<redacted>").finish()
    }
}

impl AuthToken {
    pub(crate) fn parse(raw: Option<&str>) -> Result<Option<Self>> {
        let Some(raw) = raw else {
            return Ok(None);
        };

        let token = raw.trim();
        if token.is_empty() {
            bail!("auth token must be non-empty");
        }

        Ok(Some(Self { token: token.to_string() }))
    }

    fn matches_authorization_header(&self, header_value: &str) -> bool {
        let Some(rest) = header_value.trim().strip_prefix("Bearer ") else {
            return false;
        };
        constant_time_eq(rest.trim(), &self.token)
    }

    pub(crate) fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return false;
        };
        let Ok(value) = value.to_str() else {
            return false;
        };
        self.matches_authorization_header(value)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    // Test IDs: TAUTH-001
    #[test]
    fn auth_token_parses_and_matches_bearer_header() {
        let token = match AuthToken::parse(Some("  secret  ")) {
            Ok(Some(token)) => token,
            other => panic!("expected a parsed token, got {other:?}"),
        };
        assert!(token.matches_authorization_header("Bearer secret"));
        assert!(token.matches_authorization_header("Bearer  secret  "));
        assert!(!token.matches_authorization_header("secret"));
        assert!(!token.matches_authorization_header("Bearer wrong"));
        assert!(!token.matches_authorization_header("Basic secret"));
    }

    // Test IDs: TAUTH-002
    #[test]
    fn blank_token_is_rejected_and_absent_token_disables_auth() {
        assert!(AuthToken::parse(Some("   ")).is_err());
        assert!(matches!(AuthToken::parse(None), Ok(None)));
    }

    // Test IDs: TAUTH-003
    #[test]
    fn header_map_lookup_requires_authorization_header() {
        let token = match AuthToken::parse(Some("secret")) {
            Ok(Some(token)) => token,
            other => panic!("expected a parsed token, got {other:?}"),
        };
        let mut headers = HeaderMap::new();
        assert!(!token.is_authorized(&headers));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(token.is_authorized(&headers));
    }
}
