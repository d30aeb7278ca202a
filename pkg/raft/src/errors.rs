//! Crate error type.
//!
//! Following the teacher's single-error-type-per-crate convention (there it
//! is built with `error_chain`; here with `thiserror`, the idiom the rest of
//! the example pack converges on), every fallible operation in this crate
//! returns [`Result`]. Per the persistence failure-handling design, any
//! error a node observes while touching its store is fatal and should
//! propagate all the way out of the process rather than be recovered from
//! in place.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("persistent store corrupted: {0}")]
    Corrupt(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
