//! Service-account certificate support
//!
//! A service-account id token is a JWS whose header names its own JWKS via
//! `jku`. The URL's last path segment is the service-account email; the
//! allow-list is matched against the pattern formed by replacing the
//! email's local part with `*`. Membership is exact set membership, never
//! glob expansion of the input.

use crate::TokenError;

/// Extract `(pattern, email)` from a jku URL.
///
/// `https://keys.example.com/v1/signer@corp.example` yields the pattern
/// `https://keys.example.com/v1/*@corp.example`.
pub fn jku_pattern(jku: &str) -> Result<(String, String), TokenError> {
    let url = reqwest::Url::parse(jku).map_err(|e| TokenError::InvalidJku {
        url: jku.to_string(),
        reason: e.to_string(),
    })?;

    let host = url.host_str().ok_or_else(|| TokenError::InvalidJku {
        url: jku.to_string(),
        reason: "missing host".to_string(),
    })?;

    let mut origin = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let email = segments
        .last()
        .copied()
        .ok_or_else(|| TokenError::InvalidJku {
            url: jku.to_string(),
            reason: "missing service account segment".to_string(),
        })?;

    if email.matches('@').count() != 1 {
        return Err(TokenError::InvalidJku {
            url: jku.to_string(),
            reason: "service account segment must contain exactly one '@'".to_string(),
        });
    }

    let domain = email.split('@').nth(1).unwrap_or_default();
    let prefix = segments[..segments.len() - 1].join("/");

    let pattern = if prefix.is_empty() {
        format!("{origin}/*@{domain}")
    } else {
        format!("{origin}/{prefix}/*@{domain}")
    };

    Ok((pattern, email.to_string()))
}

/// Exact-membership check of a jku's pattern against the allow-list
pub(crate) fn check_allowed(jku: &str, allowed: &[String]) -> Result<String, TokenError> {
    let (pattern, email) = jku_pattern(jku)?;
    if !allowed.iter().any(|entry| entry == &pattern) {
        return Err(TokenError::JkuNotAllowed(jku.to_string()));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_extraction() {
        let (pattern, email) =
            jku_pattern("https://keys.example.com/v1/signer@corp.example").unwrap();
        assert_eq!(pattern, "https://keys.example.com/v1/*@corp.example");
        assert_eq!(email, "signer@corp.example");
    }

    #[test]
    fn test_pattern_without_prefix() {
        let (pattern, _) = jku_pattern("https://keys.example.com/svc@corp.example").unwrap();
        assert_eq!(pattern, "https://keys.example.com/*@corp.example");
    }

    #[test]
    fn test_pattern_keeps_port() {
        let (pattern, _) =
            jku_pattern("https://keys.example.com:8443/v1/svc@corp.example").unwrap();
        assert_eq!(pattern, "https://keys.example.com:8443/v1/*@corp.example");
    }

    #[test]
    fn test_rejects_zero_or_two_ats() {
        assert!(jku_pattern("https://keys.example.com/v1/signer").is_err());
        assert!(jku_pattern("https://keys.example.com/v1/a@b@c").is_err());
    }

    #[test]
    fn test_allow_list_is_exact_membership() {
        let allowed = vec!["https://keys.example.com/v1/*@corp.example".to_string()];

        check_allowed("https://keys.example.com/v1/signer@corp.example", &allowed).unwrap();

        // A different path prefix produces a different pattern, even though
        // a glob interpretation of the entry might cover it.
        assert!(matches!(
            check_allowed("https://keys.example.com/v2/signer@corp.example", &allowed),
            Err(TokenError::JkuNotAllowed(_))
        ));
        assert!(matches!(
            check_allowed("https://keys.example.com/v1/signer@evil.example", &allowed),
            Err(TokenError::JkuNotAllowed(_))
        ));
    }
}
