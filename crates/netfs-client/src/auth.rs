//! Credentials for share mounts.

use async_trait::async_trait;
use netfs_types::Result;

use crate::config::AuthConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Asks for the credentials of one share.
#[async_trait]
pub trait CredentialPrompt: Send + Sync + 'static {
    /// `server` is the server's display name, or its address when it has
    /// none. `bad_password` is set when the previous answer was rejected.
    /// `Ok(None)` means the user cancelled.
    async fn get_authentication(
        &self,
        server: &str,
        share: &str,
        uid: u32,
        bad_password: bool,
    ) -> Result<Option<Credentials>>;
}

/// Answers every share with the configured credentials. A rejection counts
/// as a cancel, since asking again would give the same answer.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                user: user.into(),
                password: password.into(),
            },
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.user.clone(), config.password.clone())
    }
}

#[async_trait]
impl CredentialPrompt for StaticCredentials {
    async fn get_authentication(
        &self,
        server: &str,
        share: &str,
        _uid: u32,
        bad_password: bool,
    ) -> Result<Option<Credentials>> {
        if bad_password {
            tracing::warn!(server, share, user = %self.credentials.user, "credentials rejected");
            return Ok(None);
        }
        Ok(Some(self.credentials.clone()))
    }
}
