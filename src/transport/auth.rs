use async_trait::async_trait;

/// Token source and logout hook supplied by the authentication collaborator.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
    async fn force_logout(&self, reason: &str);
}

/// No token and no logout; requests go out unauthenticated.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl AuthProvider for Anonymous {
    async fn token(&self) -> Option<String> {
        None
    }

    async fn force_logout(&self, _reason: &str) {}
}

/// Fixed token, e.g. read from the environment by the binary.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl AuthProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }

    async fn force_logout(&self, reason: &str) {
        tracing::warn!(reason = %reason, "static token rejected by server");
    }
}

const AUTH_FAILURE_VOCABULARY: &[&str] = &[
    "invalid token",
    "token invalid",
    "token expired",
    "expired token",
    "jwt expired",
    "jwt malformed",
    "invalid signature",
    "not authenticated",
    "unauthenticated",
    "no user logged in",
    "authentication required",
    "session expired",
];

/// Only messages from this vocabulary justify a forced logout; a bare 401 does not.
pub fn is_auth_failure(message: &str) -> bool {
    let normalized = message.to_ascii_lowercase();
    AUTH_FAILURE_VOCABULARY
        .iter()
        .any(|phrase| normalized.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_matching_is_case_insensitive() {
        assert!(is_auth_failure("Invalid token"));
        assert!(is_auth_failure("User not authenticated"));
        assert!(is_auth_failure("JWT expired at 2024-01-01"));
        assert!(!is_auth_failure("Unauthorized"));
        assert!(!is_auth_failure("upstream auth service unavailable"));
    }
}
