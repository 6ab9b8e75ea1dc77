use std::sync::Arc;

/// Result alias that carries the custom [`ConductorError`] type.
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Error type returned by beat handlers. Any error type can be boxed into it;
/// the conductor wraps it into [`ConductorError::HandlerExecution`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Common error type for the core crate.
///
/// The enum is cheap to clone so that one failure can be delivered to the
/// play callback, the execution handle and the event bus at once.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConductorError {
    /// No sequence is mounted under the requested plugin/sequence pair.
    #[error("sequence `{sequence_id}` is not mounted for plugin `{plugin_id}`")]
    SequenceNotFound {
        plugin_id: String,
        sequence_id: String,
    },
    /// A beat references a handler the mounting plugin does not provide.
    #[error("plugin `{plugin_id}` has no handler `{handler}` required by sequence `{sequence_id}`")]
    MissingHandler {
        plugin_id: String,
        sequence_id: String,
        handler: String,
    },
    /// A different definition is already mounted under the same key.
    #[error("sequence `{sequence_id}` is already mounted for plugin `{plugin_id}` with a different definition")]
    DuplicateSequence {
        plugin_id: String,
        sequence_id: String,
    },
    /// A beat handler returned an error. The original cause is retained.
    #[error("handler `{handler}` failed at beat {beat} (`{event}`) of movement `{movement}` in sequence `{sequence}` [{correlation_id}]: {source}")]
    HandlerExecution {
        sequence: String,
        movement: String,
        beat: u32,
        event: String,
        handler: String,
        correlation_id: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// The execution was cancelled before it reached a terminal state.
    #[error("execution `{correlation_id}` was cancelled")]
    Cancelled { correlation_id: String },
    /// Structural problem in a sequence definition detected at mount time.
    #[error("invalid sequence: {0}")]
    InvalidSequence(String),
    /// No route is registered for the topic.
    #[error("no route registered for topic `{0}`")]
    UnknownTopic(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(Arc<std::io::Error>),
    #[error("{0}")]
    Message(String),
}

impl ConductorError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn sequence_not_found(plugin_id: impl Into<String>, sequence_id: impl Into<String>) -> Self {
        Self::SequenceNotFound {
            plugin_id: plugin_id.into(),
            sequence_id: sequence_id.into(),
        }
    }

    /// Returns true when the error stems from a cancelled execution.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<&str> for ConductorError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ConductorError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<std::io::Error> for ConductorError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<toml::de::Error> for ConductorError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}
