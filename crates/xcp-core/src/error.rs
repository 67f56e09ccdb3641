//! Error taxonomy for the discovery control plane.

/// Result type alias used throughout `xcp-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type covering every component of the discovery pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad location: {0}")]
    BadLocation(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("no template configured for {resource_type}/{version}")]
    NotConfigured { resource_type: String, version: String },

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn bad_location<S: Into<String>>(message: S) -> Self {
        Self::BadLocation(message.into())
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode(message.into())
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn source<S: Into<String>>(message: S) -> Self {
        Self::Source(message.into())
    }

    pub fn transform<S: Into<String>>(message: S) -> Self {
        Self::Transform(message.into())
    }

    pub fn template<S: Into<String>>(message: S) -> Self {
        Self::Template(message.into())
    }

    pub fn cipher<S: Into<String>>(message: S) -> Self {
        Self::Cipher(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// The error kind name, used by the HTTP transport to pick a status code
    /// without the transport crate needing to match on every variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadLocation(_) => "bad_location",
            Self::Decode(_) => "decode_error",
            Self::Io(_) => "io_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Source(_) => "source_error",
            Self::Transform(_) => "transform_error",
            Self::Template(_) => "template_error",
            Self::NotConfigured { .. } => "not_configured",
            Self::Cipher(_) => "cipher_error",
            Self::Timeout => "timeout",
            Self::Internal(_) => "internal_error",
            Self::Json(_) => "decode_error",
            Self::Yaml(_) => "decode_error",
            Self::Http(_) => "io_error",
        }
    }
}
