use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("GPU {index} is overcommitted: {requested} bytes requested, {available} available")]
    GpuOvercommitted {
        index: u32,
        requested: u64,
        available: u64,
    },

    #[error("GPU index {0} out of range")]
    GpuIndexOutOfRange(u32),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the controller answered 404 for the requested object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Api { status: 404, .. })
    }
}
