use thiserror::Error;

/// Crate-wide error kinds, one variant per error kind named in the
/// channel runtime design (config loading, MLLP framing, transform
/// scripts, destination I/O, stats persistence).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MLLP framing error: {0}")]
    Framing(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("I/O write error on {path}: {source}")]
    IoWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stats persistence error: {0}")]
    Persistence(String),

    #[error("HL7 parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// The `exceptionClass` name written into a translate/outbound error
    /// sidecar file.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Bind { .. } => "BindError",
            Self::Framing(_) => "FramingError",
            Self::Timeout(_) => "TimeoutError",
            Self::Transform(_) => "TransformError",
            Self::IoWrite { .. } => "IOWriteError",
            Self::Persistence(_) => "PersistenceError",
            Self::Parse(_) => "ParseError",
            Self::Io(_) => "IOError",
            Self::Yaml(_) => "YamlError",
            Self::Json(_) => "JsonError",
        }
    }
}
