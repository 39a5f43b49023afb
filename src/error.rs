#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse data: {0}")]
    Format(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("RON error: {0}")]
    Serialize(#[from] ron::Error),

    #[error("RON parse error: {0}")]
    Deserialize(#[from] ron::error::SpannedError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("Logging error: {0}")]
    Log(String),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
