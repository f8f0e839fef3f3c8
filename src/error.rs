use thiserror::Error;

pub type Result<T> = std::result::Result<T, RustArchiverError>;

/// One problem found while resolving configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub context: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

#[derive(Error, Debug)]
pub enum RustArchiverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{count} configuration error(s)")]
    ConfigErrors {
        count: usize,
        issues: Vec<ConfigIssue>,
    },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl RustArchiverError {
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn catalog<T: Into<String>>(msg: T) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn device<T: Into<String>>(msg: T) -> Self {
        Self::Device(msg.into())
    }

    pub fn queue<T: Into<String>>(msg: T) -> Self {
        Self::Queue(msg.into())
    }

    pub fn schedule<T: Into<String>>(msg: T) -> Self {
        Self::Schedule(msg.into())
    }

    pub fn parse<T: Into<String>>(msg: T) -> Self {
        Self::Parse(msg.into())
    }

    pub fn parameter_validation<T: Into<String>>(msg: T) -> Self {
        Self::ParameterValidation(msg.into())
    }
}

impl From<serde_json::Error> for RustArchiverError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for RustArchiverError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
