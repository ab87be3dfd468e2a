use crate::command::ExitCode;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Exit code reported by [`ShellError::code`] when the OS refuses to start a process.
///
/// Matches the status POSIX shells use for "command not found / not executable".
pub const SPAWN_FAILURE_CODE: ExitCode = 127;

/// Failure outcomes of an [`Invocation`](crate::Invocation).
///
/// The type is `Clone` so that completion and captured output can be observed
/// from several places at once; I/O errors are therefore held behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ShellError {
    /// The process ran and exited with a non-zero status.
    #[error("process exited with status {0}")]
    Exit(ExitCode),

    /// The operating system refused to start the process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// A stream endpoint was already taken by another consumer.
    #[error("{0} is already attached to another consumer")]
    StreamTaken(&'static str),

    /// Reading or writing one of the process streams failed.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// The background task driving the process went away before settling.
    #[error("invocation was abandoned before completion")]
    Abandoned,
}

impl ShellError {
    /// Normalize this failure to a numeric exit code.
    pub fn code(&self) -> ExitCode {
        match self {
            ShellError::Exit(code) => *code,
            ShellError::Spawn { .. } => SPAWN_FAILURE_CODE,
            ShellError::StreamTaken(_) | ShellError::Io(_) | ShellError::Abandoned => 1,
        }
    }
}

impl From<io::Error> for ShellError {
    fn from(err: io::Error) -> Self {
        ShellError::Io(Arc::new(err))
    }
}

/// Protocol errors raised by a [`BridgeWriter`](crate::bridge::BridgeWriter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// A write was attempted while the previous chunk was still unacknowledged.
    #[error("write attempted while a previous write is still in flight")]
    WriteInFlight,
    /// The writable side has already been closed.
    #[error("write after close")]
    Closed,
    /// The readable side has been dropped.
    #[error("readable side of the bridge is gone")]
    BrokenPipe,
}

impl From<BridgeError> for io::Error {
    fn from(err: BridgeError) -> Self {
        let kind = match err {
            BridgeError::WriteInFlight => io::ErrorKind::WouldBlock,
            BridgeError::Closed => io::ErrorKind::NotConnected,
            BridgeError::BrokenPipe => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}
