//! Endpoint credential injection.
//!
//! A source's secret is resolved from its `credential_ref` at connect time
//! and never logged. If the endpoint contains a `{credential}` placeholder
//! the secret is substituted into the URL; otherwise it is sent as an
//! `Authorization: Bearer` header.

use chainpipe_core::{ConfigError, CredentialRef, SourceConfig};

pub const CREDENTIAL_PLACEHOLDER: &str = "{credential}";

/// Endpoint ready to dial.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub bearer: Option<String>,
}

impl std::fmt::Debug for ResolvedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEndpoint")
            .field("url", &"<redacted>")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub fn resolve_endpoint(source: &SourceConfig) -> Result<ResolvedEndpoint, ConfigError> {
    let secret = match &source.credential_ref {
        Some(reference) => Some(CredentialRef::parse(reference)?.resolve()?),
        None => None,
    };

    match secret {
        Some(secret) if source.endpoint.contains(CREDENTIAL_PLACEHOLDER) => Ok(ResolvedEndpoint {
            url: source.endpoint.replace(CREDENTIAL_PLACEHOLDER, &secret),
            bearer: None,
        }),
        Some(secret) => Ok(ResolvedEndpoint {
            url: source.endpoint.clone(),
            bearer: Some(secret),
        }),
        None if source.endpoint.contains(CREDENTIAL_PLACEHOLDER) => Err(ConfigError::Credential {
            reference: CREDENTIAL_PLACEHOLDER.to_string(),
            reason: format!("endpoint of '{}' needs a credential_ref", source.id),
        }),
        None => Ok(ResolvedEndpoint {
            url: source.endpoint.clone(),
            bearer: None,
        }),
    }
}
