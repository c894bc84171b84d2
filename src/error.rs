use thiserror::Error;

/// Fault codes carried in RPC fault responses.
pub mod fault {
    pub const INTERNAL: i64 = 1;
    pub const METHOD_NOT_SUPPORTED: i64 = 2;
    pub const BAD_REQUEST: i64 = 3;
    pub const CREATION: i64 = 4;
    pub const LOOKUP: i64 = 5;
}

#[derive(Error, Debug)]
pub enum TorusError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology source error: {0}")]
    Topology(String),

    #[error("Process group creation failed: {0}")]
    Creation(String),

    #[error("Method not supported: {0}")]
    MethodNotSupported(String),

    #[error("Component lookup failed for {0:?}")]
    ComponentLookup(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Remote fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl TorusError {
    /// Stable code used when converting this error into an RPC fault.
    pub fn fault_code(&self) -> i64 {
        match self {
            TorusError::MethodNotSupported(_) => fault::METHOD_NOT_SUPPORTED,
            TorusError::BadRequest(_) | TorusError::Json(_) => fault::BAD_REQUEST,
            TorusError::Creation(_) => fault::CREATION,
            TorusError::ComponentLookup(_) => fault::LOOKUP,
            TorusError::Fault { code, .. } => *code,
            _ => fault::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, TorusError>;
