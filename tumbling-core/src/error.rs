use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Timestamp Error - {0}")]
    Timestamp(String),

    #[error("Lifecycle Error - {0}")]
    Lifecycle(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("Watchdog Error - {0}")]
    Watchdog(String),
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(format!("header serde: {err}"))
    }
}
