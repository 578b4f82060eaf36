use std::path::PathBuf;

/// Errors surfaced by agent setup. Nothing on the instrumentation or
/// harvest path returns these; delivery failures are `HarvestResult` values.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to build transport: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failure reported by a bus handler. The bus logs it and moves on to the
/// next handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unexpected event for {handler}: {event}")]
    UnexpectedEvent { handler: &'static str, event: String },

    #[error("{0}")]
    Other(String),
}
