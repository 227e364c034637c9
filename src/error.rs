//! Error types for riverscout

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating discovery
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// State store engine error
    #[error("state store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Secret store error
    #[error("secret store error: {0}")]
    SecretStore(String),

    /// An upstream service answered with an unexpected status
    #[error("{service} returned {status}: {body}")]
    UpstreamStatus {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// A lookup came back empty
    #[error("no object found with that name: {0}")]
    NotFound(String),

    /// No usable credentials in the global/default chain
    #[error("no credentials available")]
    CredentialsUnavailable,

    /// OID could not be converted to a MAC address
    #[error("OID parse error: {0}")]
    OidParse(String),

    /// SNMP transport failure (session setup, walk, or tool invocation)
    #[error("SNMP transport error: {0}")]
    SnmpTransport(String),

    /// The switch runs a software version on the blacklist
    #[error("unsupported switch software version: {0}")]
    BlacklistedSoftware(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
