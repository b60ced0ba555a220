use thiserror::Error;

/// Failure escaping an agent run. Surfaced to clients as the terminal `error` event.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no API key configured for provider {provider}")]
    MissingCredential { provider: String },

    #[error("provider {0} is not supported by this server")]
    UnsupportedProvider(String),

    #[error("invalid run configuration: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("malformed API response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("agent loop panicked: {0}")]
    Panic(String),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Coarse tag sent alongside the message so clients can branch on it.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential { .. } => "authentication_error",
            Self::UnsupportedProvider(_) | Self::Configuration(_) => "configuration_error",
            Self::Api { .. } => "api_error",
            Self::Network(_) => "network_error",
            Self::Serialization(_) => "serialization_error",
            Self::Panic(_) => "panic",
            Self::Other(_) => "internal_error",
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::Panic(message)
    }
}
