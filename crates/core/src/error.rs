use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("no partitions to query")]
    NoPartitions,

    #[error("buffer overflow")]
    Overflow,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, VaultError>;
