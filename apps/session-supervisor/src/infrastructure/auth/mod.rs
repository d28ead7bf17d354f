//! File-Backed Authenticator
//!
//! Reads the stream access token from a file written by the external login
//! flow. Re-authentication re-reads the file and only succeeds once the
//! token in it differs from the one the transport just rejected.
//!
//! # Flow
//!
//! 1. `current_credential` reads the file and remembers the token it served.
//! 2. The transport rejects that token.
//! 3. `force_reauthenticate` marks it rejected and re-reads the file.
//! 4. Same token: `StaleCredential`, retried on the next poll. New token:
//!    served as the replacement.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::application::ports::{Authenticator, AuthenticatorError};
use crate::domain::connection::Credential;
use crate::domain::schedule::AccountId;

#[derive(Debug, Default)]
struct TokenHistory {
    served: Option<String>,
    rejected: Option<String>,
}

/// Authenticator that reads the access token from a file.
#[derive(Debug)]
pub struct FileAuthenticator {
    path: PathBuf,
    history: Mutex<TokenHistory>,
}

impl FileAuthenticator {
    /// Create an authenticator reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            history: Mutex::new(TokenHistory::default()),
        }
    }

    /// Token file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_credential(&self) -> Result<Credential, AuthenticatorError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    AuthenticatorError::Unavailable(format!("{} not found", self.path.display()))
                }
                _ => AuthenticatorError::Backend(format!("{}: {e}", self.path.display())),
            })?;

        let token = contents.trim();
        if token.is_empty() {
            return Err(AuthenticatorError::Unavailable(format!(
                "{} is empty",
                self.path.display()
            )));
        }

        let issued_at = tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

        Ok(Credential::new(token, issued_at))
    }
}

#[async_trait]
impl Authenticator for FileAuthenticator {
    async fn current_credential(
        &self,
        account: &AccountId,
    ) -> Result<Credential, AuthenticatorError> {
        let credential = self.read_credential().await?;
        self.history.lock().served = Some(credential.token().to_string());
        tracing::debug!(account = %account, issued_at = %credential.issued_at(), "Credential loaded");
        Ok(credential)
    }

    async fn force_reauthenticate(
        &self,
        account: &AccountId,
    ) -> Result<Credential, AuthenticatorError> {
        {
            let mut history = self.history.lock();
            if let Some(served) = history.served.take() {
                history.rejected = Some(served);
            }
        }

        let credential = self.read_credential().await?;

        let mut history = self.history.lock();
        if history.rejected.as_deref() == Some(credential.token()) {
            tracing::warn!(
                account = %account,
                path = %self.path.display(),
                "Token file still holds the rejected token"
            );
            return Err(AuthenticatorError::StaleCredential);
        }

        history.served = Some(credential.token().to_string());
        tracing::info!(account = %account, issued_at = %credential.issued_at(), "Fresh credential loaded");
        Ok(credential)
    }
}

// =============================================================================
// Tests
// =============================================================================
