//! Page context collaborators: credentials and origin.

use std::env;

use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// Credentials attached to every chat request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    /// Token proving who the user is.  Required.
    pub auth_token: Option<String>,
    /// Key for the automation backend.  Required.
    pub api_key: Option<String>,
    /// Optional model provider key supplied by the user.
    pub anthropic_key: Option<String>,
    /// Optional opaque credentials relayed to the backend.
    pub relay_credentials: Option<Value>,
}

impl Credentials {
    /// Sets the auth token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the model provider key.
    pub fn with_anthropic_key(mut self, key: impl Into<String>) -> Self {
        self.anthropic_key = Some(key.into());
        self
    }

    /// Sets the relayed credentials.
    pub fn with_relay_credentials(mut self, credentials: Value) -> Self {
        self.relay_credentials = Some(credentials);
        self
    }

    /// Reads `RELAYCHAT_AUTH_TOKEN`, `RELAYCHAT_API_KEY` and
    /// `RELAYCHAT_ANTHROPIC_KEY` from the environment.
    pub fn from_env() -> Self {
        Self {
            auth_token: env::var("RELAYCHAT_AUTH_TOKEN").ok(),
            api_key: env::var("RELAYCHAT_API_KEY").ok(),
            anthropic_key: env::var("RELAYCHAT_ANTHROPIC_KEY").ok(),
            relay_credentials: None,
        }
    }

    /// Returns the auth token and API key, or the precondition failure.
    ///
    /// Blank values count as absent.
    pub fn require(&self) -> Result<(&str, &str)> {
        let auth_token = non_blank(&self.auth_token)
            .ok_or_else(|| Error::missing_credential("no auth token available"))?;
        let api_key =
            non_blank(&self.api_key).ok_or_else(|| Error::missing_config("no API key configured"))?;
        Ok((auth_token, api_key))
    }

    /// The model provider key, if one is set and not blank.
    pub fn anthropic_key(&self) -> Option<&str> {
        non_blank(&self.anthropic_key)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Supplies the credentials current at the moment a send begins.
pub trait CredentialProvider: Send + Sync {
    /// Returns the current credentials.
    fn credentials(&self) -> Credentials;
}

/// Credential provider holding a fixed value.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Wraps `credentials`.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }
}

/// The page a conversation is scoped to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageOrigin {
    /// Key for the session store; the host name.
    pub key: String,
    /// Backend the agent should act on, deduced from the page.
    pub api_url: String,
}

/// Resolves the origin of the current page.
pub trait OriginResolver: Send + Sync {
    /// Returns the current origin or an origin resolution failure.
    fn resolve(&self) -> Result<PageOrigin>;
}

/// Resolver backed by the page URL.
#[derive(Clone, Debug)]
pub struct UrlOriginResolver {
    page_url: String,
}

impl UrlOriginResolver {
    /// Creates a resolver for `page_url`.
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
        }
    }
}

impl OriginResolver for UrlOriginResolver {
    fn resolve(&self) -> Result<PageOrigin> {
        let url = Url::parse(&self.page_url)?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::origin_resolution(format!("{} has no host", self.page_url), None))?;
        Ok(PageOrigin {
            key: host.to_string(),
            api_url: format!("{}://{}/", url.scheme(), host),
        })
    }
}
