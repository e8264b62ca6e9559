//! API credential lookup
//!
//! The Gemini API key is read from the environment (`GEMINI_API_KEY`, falling
//! back to `API_KEY`). Lookup happens on every session creation rather than
//! at startup, so a missing key only blocks the action that needed it and a
//! fixed environment is picked up on the next attempt.
//!
//! Speech transcription authenticates with an OAuth access token instead,
//! read from `GOOGLE_ACCESS_TOKEN` when a transcription is requested.
//!
//! # Security
//! - The key is zeroized when the credential is dropped
//! - `Debug` output never includes the key

use crate::error::CredentialError;
use std::fmt;
use zeroize::Zeroize;

/// Primary environment variable holding the API key
pub(crate) const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Fallback environment variable
pub(crate) const API_KEY_FALLBACK_ENV: &str = "API_KEY";

/// Environment variable holding the access token for transcription
pub(crate) const ACCESS_TOKEN_ENV: &str = "GOOGLE_ACCESS_TOKEN";

/// Gemini API credential.
#[derive(Clone)]
pub(crate) struct GeminiCredentials {
    api_key: String,
}

impl GeminiCredentials {
    pub(crate) fn new(api_key: impl Into<String>) -> Result<Self, CredentialError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(Self {
            api_key: api_key.trim().to_string(),
        })
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for GeminiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Drop for GeminiCredentials {
    fn drop(&mut self) {
        // Clear API key from memory
        self.api_key.zeroize();
    }
}

/// Source of the API credential.
pub(crate) trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<GeminiCredentials, CredentialError>;
}

/// Reads the credential from the process environment.
#[derive(Debug, Default)]
pub(crate) struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credentials(&self) -> Result<GeminiCredentials, CredentialError> {
        credentials_from(|key| std::env::var(key).ok())
    }
}

/// Resolve credentials from a variable lookup
pub(crate) fn credentials_from<F>(lookup: F) -> Result<GeminiCredentials, CredentialError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(API_KEY_ENV)
        .or_else(|| lookup(API_KEY_FALLBACK_ENV))
        .ok_or(CredentialError::Missing)?;
    GeminiCredentials::new(value)
}

/// OAuth bearer token for Google Cloud APIs
pub(crate) struct AccessToken {
    token: String,
}

impl AccessToken {
    pub(crate) fn secret(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

/// Resolve the transcription access token from a variable lookup
pub(crate) fn access_token_from<F>(lookup: F) -> Result<AccessToken, CredentialError>
where
    F: Fn(&str) -> Option<String>,
{
    let token = lookup(ACCESS_TOKEN_ENV)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(CredentialError::MissingAccessToken)?;
    Ok(AccessToken { token })
}

/// Fixed credential for tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct StaticCredentials(Option<GeminiCredentials>);

#[cfg(test)]
impl StaticCredentials {
    pub(crate) fn new(api_key: &str) -> Self {
        Self(GeminiCredentials::new(api_key).ok())
    }

    pub(crate) fn missing() -> Self {
        Self(None)
    }
}

#[cfg(test)]
impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<GeminiCredentials, CredentialError> {
        self.0.clone().ok_or(CredentialError::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_variable_wins() {
        let creds = credentials_from(|key| match key {
            "GEMINI_API_KEY" => Some("primary".to_string()),
            "API_KEY" => Some("fallback".to_string()),
            _ => None,
        })
        .expect("credential should resolve");
        assert_eq!(creds.api_key(), "primary");
    }

    #[test]
    fn test_fallback_variable() {
        let creds = credentials_from(|key| (key == "API_KEY").then(|| "fallback".to_string()))
            .expect("credential should resolve");
        assert_eq!(creds.api_key(), "fallback");
    }

    #[test]
    fn test_missing_and_empty() {
        assert!(matches!(
            credentials_from(|_| None),
            Err(CredentialError::Missing)
        ));
        assert!(matches!(
            credentials_from(|_| Some("  ".to_string())),
            Err(CredentialError::Empty)
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let creds = GeminiCredentials::new("secret-key").unwrap();
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn test_access_token_lookup() {
        let token = access_token_from(|key| {
            (key == "GOOGLE_ACCESS_TOKEN").then(|| " ya29.token ".to_string())
        })
        .unwrap();
        assert_eq!(token.secret(), "ya29.token");
        assert!(!format!("{:?}", token).contains("ya29"));

        assert!(matches!(
            access_token_from(|_| Some(String::new())),
            Err(CredentialError::MissingAccessToken)
        ));
    }

    #[test]
    fn test_static_provider() {
        assert!(StaticCredentials::missing().credentials().is_err());
        let creds = StaticCredentials::new("k").credentials().unwrap();
        assert_eq!(creds.api_key(), "k");
    }
}
