use crate::bridge::{BridgeReader, BridgeWriter};
use crate::descriptors::AuxStream;
use crate::invocation::{Invocation, Link};
use crate::resolver::SearchPath;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// Processes killed by signal `S` report `128 + S`, as POSIX shells do.
pub type ExitCode = i32;

/// One element of an invocation's argument list.
pub enum Arg {
    /// Passed to the process unchanged.
    Text(String),
    /// Replaced by the nested invocation's captured stdout (command substitution).
    Invocation(Invocation),
    /// Exposed to the process as a readable `/dev/fd/N`.
    Input(Box<dyn AsyncRead + Send + Unpin>),
    /// Exposed to the process as a writable `/dev/fd/N`.
    Output(Box<dyn AsyncWrite + Send + Unpin>),
}

impl Arg {
    /// A stream the process will read through a descriptor path.
    pub fn input(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Arg::Input(Box::new(reader))
    }

    /// A stream the process will write through a descriptor path.
    pub fn output(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Arg::Output(Box::new(writer))
    }

    pub(crate) fn into_aux(self) -> Option<AuxStream> {
        match self {
            Arg::Input(reader) => Some(AuxStream::Input(reader)),
            Arg::Output(writer) => Some(AuxStream::Output(writer)),
            Arg::Text(_) | Arg::Invocation(_) => None,
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Arg::Invocation(inv) => f.debug_tuple("Invocation").field(inv).finish(),
            Arg::Input(_) => f.write_str("Input(..)"),
            Arg::Output(_) => f.write_str("Output(..)"),
        }
    }
}

impl From<&str> for Arg {
    fn from(text: &str) -> Self {
        Arg::Text(text.to_owned())
    }
}

impl From<&String> for Arg {
    fn from(text: &String) -> Self {
        Arg::Text(text.clone())
    }
}

impl From<String> for Arg {
    fn from(text: String) -> Self {
        Arg::Text(text)
    }
}

impl From<&Path> for Arg {
    fn from(path: &Path) -> Self {
        Arg::Text(path.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for Arg {
    fn from(path: PathBuf) -> Self {
        Arg::from(path.as_path())
    }
}

impl From<Invocation> for Arg {
    fn from(inv: Invocation) -> Self {
        Arg::Invocation(inv)
    }
}

impl From<BridgeReader> for Arg {
    fn from(reader: BridgeReader) -> Self {
        Arg::input(reader)
    }
}

impl From<BridgeWriter> for Arg {
    fn from(writer: BridgeWriter) -> Self {
        Arg::output(writer)
    }
}

/// Process-level settings shared by every invocation of a session.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpawnContext {
    pub search_path: SearchPath,
    pub current_dir: Option<PathBuf>,
    pub vars: HashMap<String, String>,
}

/// A resolved executable that can be called to start invocations.
///
/// Obtained from [`Environment::dispatch`](crate::Environment::dispatch) or
/// [`Invocation::dispatch`]. In the latter case every invocation created by
/// the command reads the originating invocation's stdout as its stdin.
#[derive(Clone)]
pub struct Command {
    program: PathBuf,
    context: Arc<SpawnContext>,
    upstream: Option<Link>,
}

impl Command {
    pub(crate) fn new(
        program: PathBuf,
        context: Arc<SpawnContext>,
        upstream: Option<Link>,
    ) -> Self {
        Self {
            program,
            context,
            upstream,
        }
    }

    /// Absolute (or caller-given direct) path of the executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Whether invocations of this command are piped from another invocation.
    pub fn is_chained(&self) -> bool {
        self.upstream.is_some()
    }

    /// Start a new invocation with `args`.
    ///
    /// Returns immediately with an unstarted invocation whose streams can be
    /// taken right away. Argument resolution and spawning run in the background
    /// once it is started. Spawn failures are only reported through the
    /// invocation's result.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn call<I, A>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        let args = args.into_iter().map(Into::into).collect();
        Invocation::new(
            self.program.clone(),
            args,
            self.context.clone(),
            self.upstream.as_ref(),
        )
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("chained", &self.is_chained())
            .finish()
    }
}
