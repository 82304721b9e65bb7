//! Broker credentials
//!
//! The secret is stored once and only leaves this module through
//! [`ConnectionCredentials::expose_secret`], which is crate-private. Debug
//! output redacts it and every error message here is secret-free.

use crate::error::sanitize_error_message;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use url::Url;

const DEFAULT_MQTT_PORT: u16 = 1883;
const REDACTED: &str = "***";

/// Credential construction errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("broker principal must not be empty")]
    EmptyPrincipal,
    #[error("secret for principal '{principal}' must not be empty")]
    EmptySecret { principal: String },
    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),
    #[error("invalid broker address: {0}")]
    InvalidBroker(String),
}

/// Plain TCP broker endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerAddress {
    host: String,
    port: u16,
}

impl BrokerAddress {
    /// Parse `mqtt://host[:port]` or `tcp://host[:port]`
    ///
    /// The raw URL is never echoed back in errors since it may carry userinfo.
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        let url = Url::parse(raw)
            .map_err(|_| CredentialError::InvalidBroker("not a valid URL".to_string()))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => {
                return Err(CredentialError::InvalidBroker(
                    "TLS transport is not supported".to_string(),
                ))
            }
            other => {
                return Err(CredentialError::InvalidBroker(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(CredentialError::InvalidBroker(
                "credentials must not be embedded in the broker URL".to_string(),
            ));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CredentialError::InvalidBroker("missing host".to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Validated broker credentials, immutable after construction
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    broker: BrokerAddress,
    principal: String,
    secret: String,
}

impl ConnectionCredentials {
    pub fn new<P: Into<String>, S: Into<String>>(
        broker: BrokerAddress,
        principal: P,
        secret: S,
    ) -> Result<Self, CredentialError> {
        let principal = principal.into();
        let secret = secret.into();

        if principal.trim().is_empty() {
            return Err(CredentialError::EmptyPrincipal);
        }
        if secret.trim().is_empty() {
            return Err(CredentialError::EmptySecret { principal });
        }

        Ok(Self {
            broker,
            principal,
            secret,
        })
    }

    pub fn broker(&self) -> &BrokerAddress {
        &self.broker
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub(crate) fn expose_secret(&self) -> &str {
        &self.secret
    }

    /// Scrub the secret and common secret patterns from free-form text
    pub fn redact(&self, text: &str) -> String {
        sanitize_error_message(&text.replace(&self.secret, REDACTED))
    }
}

impl fmt::Debug for ConnectionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCredentials")
            .field("broker", &self.broker)
            .field("principal", &self.principal)
            .field("secret", &REDACTED)
            .finish()
    }
}

/// Where credentials come from; consulted before every connect attempt
pub trait CredentialSource: Send + Sync {
    fn load(&self) -> Result<ConnectionCredentials, CredentialError>;
}

/// Fixed values, validated on every load
#[derive(Clone)]
pub struct StaticCredentials {
    broker_url: String,
    principal: String,
    secret: String,
}

impl StaticCredentials {
    pub fn new<B: Into<String>, P: Into<String>, S: Into<String>>(
        broker_url: B,
        principal: P,
        secret: S,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            principal: principal.into(),
            secret: secret.into(),
        }
    }
}

impl CredentialSource for StaticCredentials {
    fn load(&self) -> Result<ConnectionCredentials, CredentialError> {
        let broker = BrokerAddress::parse(&self.broker_url)?;
        ConnectionCredentials::new(broker, self.principal.clone(), self.secret.clone())
    }
}

/// Principal and secret read from environment variables at each load
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    broker_url: String,
    principal_var: String,
    secret_var: String,
}

impl EnvCredentials {
    pub fn new<B: Into<String>, P: Into<String>, S: Into<String>>(
        broker_url: B,
        principal_var: P,
        secret_var: S,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            principal_var: principal_var.into(),
            secret_var: secret_var.into(),
        }
    }

    fn get_env_var_required(name: &str) -> Result<String, CredentialError> {
        std::env::var(name).map_err(|_| CredentialError::MissingEnvVar(name.to_string()))
    }
}

impl CredentialSource for EnvCredentials {
    fn load(&self) -> Result<ConnectionCredentials, CredentialError> {
        let broker = BrokerAddress::parse(&self.broker_url)?;
        let principal = Self::get_env_var_required(&self.principal_var)?;
        let secret = Self::get_env_var_required(&self.secret_var)?;
        ConnectionCredentials::new(broker, principal, secret)
    }
}
