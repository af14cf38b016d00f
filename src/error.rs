use std::io;

/// Crate-wide error taxonomy. See `SPEC_FULL.md` §7 for the recovery
/// contract of each variant.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("peer closed stream")]
    PeerClosed,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("interrupted")]
    Interrupted,

    #[error("failed to register {identifier} with event queue: {source}")]
    Registration {
        identifier: String,
        #[source]
        source: io::Error,
    },

    #[error("exec failed: {0}")]
    ExecFailed(io::Error),

    #[error("could not prepare child stdio: {0}")]
    CouldNotPrepareStdio(io::Error),

    #[error("corrupt subprocess ipc frame")]
    IpcCorrupt,

    #[error("database connection failed: {0}")]
    ConnectFailed(String),

    #[error("query error ({code}): {message}")]
    QueryError { message: String, code: String },

    #[error("pipeline aborted")]
    PipelineAborted,

    #[error("database connection broken: {0}")]
    ConnectionBroken(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
