use thiserror::Error;

/// Error taxonomy for the plugin (spec §7).
///
/// No variant carries a raw pointer or a borrowed lifetime: every error
/// is owned so it can cross the control-channel / host-daemon callback
/// boundary freely.
#[derive(Debug, Error)]
pub enum ExtsockError {
    /// JSON structurally valid but semantically rejected (missing required
    /// field, unknown auth class, malformed CIDR, identity too long, …).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Input is not well-formed JSON.
    #[error("malformed JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// accept/read/write/bind error on the control socket.
    #[error("control socket failure: {0}")]
    SocketFailure(String),

    /// A host-daemon call returned a non-success status, or a required
    /// subsystem pointer was unavailable.
    #[error("host daemon call failed: {0}")]
    HostApiFailure(String),

    /// Memory exhaustion (surfaced so callers can log it distinctly from
    /// a plain I/O failure; never spuriously produced).
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// Unknown command verb, or a verb missing its required payload.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

pub type Result<T> = std::result::Result<T, ExtsockError>;

impl ExtsockError {
    pub fn config_invalid(field: impl Into<String>) -> Self {
        Self::ConfigInvalid(field.into())
    }

    pub fn socket_failure(context: impl Into<String>) -> Self {
        Self::SocketFailure(context.into())
    }

    pub fn host_api_failure(context: impl Into<String>) -> Self {
        Self::HostApiFailure(context.into())
    }

    pub fn invalid_command(context: impl Into<String>) -> Self {
        Self::InvalidCommand(context.into())
    }
}
