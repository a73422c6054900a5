//! Credential acquisition for service calls and socket upgrades.
//!
//! Token acquisition itself lives outside this crate. Callers hand in a
//! [`CredentialProvider`] that signs one request at a time; the client treats
//! the returned token as opaque.

use async_trait::async_trait;

use crate::error::Result;

/// Identity of the signed-in user that owns a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserContext {
    /// Stable user id (XUID). Used as the activation-limiter key.
    pub user_id: String,
    /// Display name, for logging only.
    pub gamertag: Option<String>,
}

impl UserContext {
    /// Create a user context with no gamertag.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            gamertag: None,
        }
    }

    /// Attach a gamertag.
    #[must_use]
    pub fn with_gamertag(mut self, gamertag: impl Into<String>) -> Self {
        self.gamertag = Some(gamertag.into());
        self
    }
}

/// Authorization material for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAndSignature {
    /// Value for the `Authorization` header.
    pub token: String,
    /// Value for the `Signature` header; empty when the endpoint needs none.
    pub signature: String,
    /// User the token was issued to.
    pub user_id: String,
    /// Gamertag claim, if present.
    pub gamertag: Option<String>,
}

impl TokenAndSignature {
    /// Header pairs to attach to a request.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("Authorization".to_owned(), self.token.clone())];
        if !self.signature.is_empty() {
            headers.push(("Signature".to_owned(), self.signature.clone()));
        }
        headers
    }
}

/// Signs outgoing requests for a single user.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Acquire a token (and signature) for the given request.
    async fn token_and_signature(
        &self,
        method: &str,
        uri: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<TokenAndSignature>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_skip_empty_signature() {
        let creds = TokenAndSignature {
            token: "XBL3.0 x=1;abc".into(),
            signature: String::new(),
            user_id: "1".into(),
            gamertag: None,
        };
        assert_eq!(
            creds.headers(),
            vec![("Authorization".to_owned(), "XBL3.0 x=1;abc".to_owned())]
        );
    }

    #[test]
    fn headers_include_signature_when_present() {
        let creds = TokenAndSignature {
            token: "t".into(),
            signature: "s".into(),
            user_id: "1".into(),
            gamertag: Some("Player".into()),
        };
        assert_eq!(creds.headers().len(), 2);
    }

    #[test]
    fn user_context_builder() {
        let user = UserContext::new("2533274").with_gamertag("Player One");
        assert_eq!(user.user_id, "2533274");
        assert_eq!(user.gamertag.as_deref(), Some("Player One"));
    }
}
