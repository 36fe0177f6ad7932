use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The resume token is no longer served; only a full list can recover.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed object: {0}")]
    Malformed(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("index already exists: {0}")]
    IndexExists(String),
    #[error("unknown handler: {0}")]
    UnknownHandler(u64),
    #[error("informer already started")]
    AlreadyStarted,
    #[error("informer stopped")]
    Stopped,
    #[error("runtime: {0}")]
    Runtime(String),
}

impl Error {
    pub fn is_expired(&self) -> bool {
        matches!(self, Error::Expired(_))
    }

    /// Errors reported on a watch stream that leave the stream usable.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Error::Malformed(_))
    }
}
