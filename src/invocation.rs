//! The invocation value: one prospective child process.
//!
//! Construction allocates the stdin/stdout/stderr bridges and returns at once.
//! A background driver then waits for a start signal, resolves the argument
//! list, evaluates the terminal fallback for every endpoint nobody took, spawns
//! the process and pumps bytes between the bridges and the real descriptors.
//!
//! ```text
//!   Command::call ──▶ Invocation (bridges ready, take_* allowed)
//!        │
//!        └─▶ driver: start ─▶ resolve args ─▶ checkpoint ─▶ spawn ─▶ pump ─▶ settle
//!                              (await nested     (untaken ends
//!                               invocations)      inherit terminal)
//! ```
//!
//! The driver starts when the result is requested (`wait`, `code`, `lines`,
//! `string`, `line_reader`, `.await`), when [`Invocation::start`] is called,
//! when data first moves through an endpoint the caller took, when a chained
//! invocation starts, or when the handle is dropped. Until then every endpoint
//! can be taken, whatever runtime flavor the caller uses.

use crate::bridge::{BridgeReader, BridgeWriter, bridge};
use crate::command::{Arg, Command, ExitCode, SpawnContext};
use crate::descriptors::{AuxPlan, AuxStream, FIRST_AUX_FD, fd_token};
use crate::error::ShellError;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use futures::stream::BoxStream;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

const PUMP_BUFFER: usize = 8 * 1024;

/// Completion state of an invocation.
#[derive(Debug, Clone)]
pub enum State {
    /// Not started yet, or arguments are being resolved; no process exists.
    Pending,
    /// The process has been spawned and has not exited.
    Running,
    /// The process exited with status 0.
    Succeeded,
    /// The process exited with a non-zero status.
    Failed(ExitCode),
    /// The process never ran (spawn refused, substitution failed, ...).
    Errored(ShellError),
}

impl State {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            State::Succeeded | State::Failed(_) | State::Errored(_)
        )
    }

    fn into_result(self) -> Result<(), ShellError> {
        match self {
            State::Succeeded => Ok(()),
            State::Failed(code) => Err(ShellError::Exit(code)),
            State::Errored(err) => Err(err),
            State::Pending | State::Running => Err(ShellError::Abandoned),
        }
    }
}

type Capture = Shared<BoxFuture<'static, Result<Arc<Vec<String>>, ShellError>>>;

/// Caller-facing halves of the three primary bridges.
///
/// `None` means the endpoint was taken by a consumer, or was connected to the
/// terminal at the checkpoint.
struct Endpoints {
    stdin: Option<BridgeWriter>,
    stdout: Option<BridgeReader>,
    stderr: Option<BridgeReader>,
    /// Stdin ends of chained invocations, each fed a copy of stdout.
    links: Vec<BridgeWriter>,
    /// Set at the checkpoint; no link can be added afterwards.
    sealed: bool,
}

/// Process-facing halves, owned by the driver.
struct Halves {
    stdin: BridgeReader,
    stdout: BridgeWriter,
    stderr: BridgeWriter,
}

/// How the primary streams are wired, decided at the checkpoint.
struct Wiring {
    stdin: bool,
    stdout: bool,
    stderr: bool,
    links: Vec<BridgeWriter>,
}

impl Wiring {
    fn stdout_piped(&self) -> bool {
        self.stdout || !self.links.is_empty()
    }
}

struct Inner {
    program: PathBuf,
    context: Arc<SpawnContext>,
    endpoints: Mutex<Endpoints>,
    state: watch::Receiver<State>,
    capture: Mutex<Option<Capture>>,
    pid: OnceLock<u32>,
    start: Arc<Notify>,
}

impl Inner {
    fn endpoints(&self) -> MutexGuard<'_, Endpoints> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Evaluate the terminal fallback exactly once.
    ///
    /// Endpoints still present were never claimed: they are dropped here and
    /// the child inherits the controlling process's descriptor instead.
    fn checkpoint(&self) -> Wiring {
        let mut endpoints = self.endpoints();
        endpoints.sealed = true;
        Wiring {
            stdin: endpoints.stdin.take().is_none(),
            stdout: endpoints.stdout.take().is_none(),
            stderr: endpoints.stderr.take().is_none(),
            links: std::mem::take(&mut endpoints.links),
        }
    }
}

/// Handle to an upstream invocation whose stdout feeds chained commands.
#[derive(Clone)]
pub(crate) struct Link {
    inner: Arc<Inner>,
}

/// One external command, from argument resolution to exit.
///
/// An invocation is both a completion handle and a set of stream endpoints:
///
/// - `inv.await`, [`wait`](Self::wait): `Ok(())` on status 0, otherwise a
///   [`ShellError`] carrying the exit code or the spawn failure;
/// - [`code`](Self::code): the exit status as a number, never an error;
/// - [`lines`](Self::lines) / [`string`](Self::string): captured stdout;
/// - [`take_stdin`](Self::take_stdin), [`take_stdout`](Self::take_stdout),
///   [`take_stderr`](Self::take_stderr): raw bridge endpoints.
///
/// Nothing runs until the invocation is started (see the module docs).
/// Endpoints nobody takes before then are connected to the controlling
/// terminal. Dropping an invocation starts it and never kills its process.
pub struct Invocation {
    inner: Arc<Inner>,
}

impl Invocation {
    pub(crate) fn new(
        program: PathBuf,
        args: Vec<Arg>,
        context: Arc<SpawnContext>,
        upstream: Option<&Link>,
    ) -> Self {
        let (stdin_writer, stdin_reader) = bridge();
        let (stdout_writer, stdout_reader) = bridge();
        let (stderr_writer, stderr_reader) = bridge();
        let (state_tx, state_rx) = watch::channel(State::Pending);

        let inv = Invocation {
            inner: Arc::new(Inner {
                program,
                context,
                endpoints: Mutex::new(Endpoints {
                    stdin: Some(stdin_writer),
                    stdout: Some(stdout_reader),
                    stderr: Some(stderr_reader),
                    links: Vec::new(),
                    sealed: false,
                }),
                state: state_rx,
                capture: Mutex::new(None),
                pid: OnceLock::new(),
                start: Arc::new(Notify::new()),
            }),
        };

        if let Some(link) = upstream {
            inv.pipe_from(link);
        }

        // Substituted invocations must claim their stdout now, before their
        // own drivers reach the checkpoint.
        for arg in &args {
            if let Arg::Invocation(nested) = arg {
                drop(nested.capture());
            }
        }

        let halves = Halves {
            stdin: stdin_reader,
            stdout: stdout_writer,
            stderr: stderr_writer,
        };
        let span = tracing::debug_span!("invocation", program = %inv.inner.program.display());
        tokio::spawn(
            drive(inv.inner.clone(), args, halves, upstream.cloned(), state_tx).instrument(span),
        );
        inv
    }

    /// Register this invocation's stdin as a copy target of `upstream`'s stdout.
    fn pipe_from(&self, upstream: &Link) {
        let Some(stdin) = self.inner.endpoints().stdin.take() else {
            return;
        };
        let mut source = upstream.inner.endpoints();
        if source.sealed {
            tracing::warn!(
                upstream = %upstream.inner.program.display(),
                "upstream already wired; chained stdin will be empty"
            );
            return;
        }
        source.links.push(stdin.notify_on_use(self.inner.start.clone()));
    }

    /// Let the driver proceed. Further calls have no effect.
    pub fn start(&self) {
        self.inner.start.notify_one();
    }

    /// Path of the executable this invocation runs.
    pub fn program(&self) -> &Path {
        &self.inner.program
    }

    /// Current completion state, without waiting or starting.
    pub fn state(&self) -> State {
        self.inner.state.borrow().clone()
    }

    /// Process id, once the process has been spawned.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.get().copied()
    }

    /// Take the writable end of stdin. Returns `None` if it was already taken
    /// or the process already started with the terminal as its stdin.
    ///
    /// Writing to the returned end starts the invocation.
    pub fn take_stdin(&self) -> Option<BridgeWriter> {
        let writer = self.inner.endpoints().stdin.take()?;
        Some(writer.notify_on_use(self.inner.start.clone()))
    }

    /// Take the readable end of stdout. See [`take_stdin`](Self::take_stdin).
    ///
    /// Reading from the returned end starts the invocation.
    pub fn take_stdout(&self) -> Option<BridgeReader> {
        let reader = self.inner.endpoints().stdout.take()?;
        Some(reader.notify_on_use(self.inner.start.clone()))
    }

    /// Take the readable end of stderr. See [`take_stdout`](Self::take_stdout).
    pub fn take_stderr(&self) -> Option<BridgeReader> {
        let reader = self.inner.endpoints().stderr.take()?;
        Some(reader.notify_on_use(self.inner.start.clone()))
    }

    /// Resolve `name` to a command whose invocations read this invocation's
    /// stdout as their stdin. `None` if no executable matches.
    ///
    /// Every invocation created from the returned command before this one is
    /// wired receives its own copy of stdout. Later ones get an empty stdin.
    pub fn dispatch(&self, name: &str) -> Option<Command> {
        let program = self.inner.context.search_path.resolve(name)?;
        Some(Command::new(
            program,
            self.inner.context.clone(),
            Some(Link {
                inner: self.inner.clone(),
            }),
        ))
    }

    /// Start the invocation and wait for the process to finish.
    ///
    /// `Ok(())` for exit status 0, [`ShellError::Exit`] for any other status,
    /// and another [`ShellError`] variant if the process never ran.
    pub fn wait(&self) -> impl Future<Output = Result<(), ShellError>> + Send + 'static {
        self.start();
        let mut state = self.inner.state.clone();
        async move {
            let settled = match state.wait_for(State::is_settled).await {
                Ok(settled) => settled.clone(),
                Err(_) => return Err(ShellError::Abandoned),
            };
            settled.into_result()
        }
    }

    /// The exit status as a number. Never fails: a process that could not be
    /// spawned reports [`SPAWN_FAILURE_CODE`](crate::error::SPAWN_FAILURE_CODE).
    pub fn code(&self) -> impl Future<Output = ExitCode> + Send + 'static {
        let done = self.wait();
        async move {
            match done.await {
                Ok(()) => 0,
                Err(err) => err.code(),
            }
        }
    }

    /// Lazy stream of stdout lines, read as the process produces them.
    ///
    /// Not restartable; `None` if stdout was already taken or captured.
    pub fn line_reader(&self) -> Option<BoxStream<'static, io::Result<String>>> {
        let reader = BufReader::new(self.inner.endpoints().stdout.take()?);
        self.start();
        let lines = futures::stream::unfold(reader, |mut reader| async move {
            match next_line(&mut reader).await {
                Ok(Some(line)) => Some((Ok(line), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        });
        Some(Box::pin(lines))
    }

    /// All stdout lines, once stdout reaches end-of-stream.
    ///
    /// Lines are split on `\n` (a preceding `\r` is removed) and decoded as
    /// lossy UTF-8. Stdout is captured once; repeated calls return the same
    /// lines. The exit status does not affect the result.
    pub fn lines(&self) -> impl Future<Output = Result<Vec<String>, ShellError>> + Send + 'static {
        let capture = self.capture();
        async move { Ok(capture.await?.as_ref().clone()) }
    }

    /// [`lines`](Self::lines) joined with `\n`.
    pub fn string(&self) -> impl Future<Output = Result<String, ShellError>> + Send + 'static {
        let capture = self.capture();
        async move { Ok(capture.await?.join("\n")) }
    }

    /// Shared capture of stdout, started on first use.
    fn capture(&self) -> Capture {
        let mut slot = self.inner.capture.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(capture) = slot.as_ref() {
            return capture.clone();
        }

        let stdout = self.inner.endpoints().stdout.take();
        self.start();
        let capture = match stdout {
            Some(reader) => {
                let collector = tokio::spawn(read_lines(reader));
                async move {
                    match collector.await {
                        Ok(Ok(lines)) => Ok(Arc::new(lines)),
                        Ok(Err(e)) => Err(ShellError::from(e)),
                        Err(_) => Err(ShellError::Abandoned),
                    }
                }
                .boxed()
                .shared()
            }
            None => futures::future::ready(Err(ShellError::StreamTaken("stdout")))
                .boxed()
                .shared(),
        };
        *slot = Some(capture.clone());
        capture
    }
}

impl IntoFuture for Invocation {
    type Output = Result<(), ShellError>;
    type IntoFuture = BoxFuture<'static, Result<(), ShellError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        self.start();
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.inner.program)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

async fn drive(
    inner: Arc<Inner>,
    args: Vec<Arg>,
    halves: Halves,
    upstream: Option<Link>,
    state_tx: watch::Sender<State>,
) {
    inner.start.notified().await;
    if let Some(link) = upstream {
        link.inner.start.notify_one();
    }

    let settled = match run(&inner, args, halves, &state_tx).await {
        Ok(0) => State::Succeeded,
        Ok(code) => State::Failed(code),
        Err(err) => State::Errored(err),
    };
    tracing::debug!(state = ?settled, "invocation settled");
    state_tx.send_replace(settled);
}

async fn run(
    inner: &Inner,
    args: Vec<Arg>,
    halves: Halves,
    state_tx: &watch::Sender<State>,
) -> Result<ExitCode, ShellError> {
    let (argv, aux) = resolve_args(args).await?;
    let aux_count = aux.len();
    let plan = AuxPlan::allocate(aux)?;
    let wiring = inner.checkpoint();
    tracing::debug!(
        stdin = wiring.stdin,
        stdout = wiring.stdout,
        stderr = wiring.stderr,
        links = wiring.links.len(),
        aux = aux_count,
        "arguments resolved"
    );

    let mut cmd = tokio::process::Command::new(&inner.program);
    cmd.args(&argv)
        .envs(&inner.context.vars)
        .stdin(stdio_for(wiring.stdin))
        .stdout(stdio_for(wiring.stdout_piped()))
        .stderr(stdio_for(wiring.stderr));
    if let Some(dir) = &inner.context.current_dir {
        cmd.current_dir(dir);
    }
    plan.install(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| ShellError::Spawn {
        program: inner.program.display().to_string(),
        source: Arc::new(e),
    })?;
    let aux_tasks = plan.start();
    if let Some(pid) = child.id() {
        let _ = inner.pid.set(pid);
        tracing::debug!(pid, "spawned");
    }
    state_tx.send_replace(State::Running);

    let Halves {
        stdin: mut stdin_source,
        stdout,
        stderr,
    } = halves;

    let stdin_pump = child.stdin.take().map(|mut sink| {
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin_source, &mut sink).await {
                tracing::debug!(error = %e, "stdin closed before input was consumed");
            }
        })
    });

    let mut stdout_sinks = wiring.links;
    if wiring.stdout {
        stdout_sinks.push(stdout);
    }
    let mut drains = Vec::new();
    if let Some(source) = child.stdout.take() {
        drains.push(drain(source, stdout_sinks, "stdout"));
    }
    if let Some(source) = child.stderr.take() {
        drains.push(drain(source, vec![stderr], "stderr"));
    }

    let status = child.wait().await?;

    for task in drains.into_iter().chain(aux_tasks.drainers) {
        let _ = task.await;
    }
    // Input pumps may be parked on a producer that never finishes.
    if let Some(task) = stdin_pump {
        task.abort();
    }
    for task in aux_tasks.feeders {
        task.abort();
    }

    Ok(exit_code(status))
}

/// Resolve every argument to its final text form.
///
/// Nested invocations are awaited and substituted; stream arguments become
/// descriptor tokens and are returned separately in slot order.
async fn resolve_args(args: Vec<Arg>) -> Result<(Vec<String>, Vec<AuxStream>), ShellError> {
    let mut argv = Vec::with_capacity(args.len());
    let mut aux = Vec::new();

    for arg in args {
        match arg {
            Arg::Text(text) => argv.push(text),
            Arg::Invocation(nested) => argv.push(nested.string().await?),
            stream @ (Arg::Input(_) | Arg::Output(_)) => {
                let slot = FIRST_AUX_FD + aux.len() as RawFd;
                argv.push(fd_token(slot));
                aux.extend(stream.into_aux());
            }
        }
    }
    Ok((argv, aux))
}

fn stdio_for(attached: bool) -> Stdio {
    if attached { Stdio::piped() } else { Stdio::inherit() }
}

/// Copy `source` into every sink, chunk by chunk, until end-of-stream.
///
/// A sink whose reader is gone is dropped. Once no sink is left the source is
/// closed, so the process sees a broken pipe as it would in a shell.
fn drain<R>(mut source: R, mut sinks: Vec<BridgeWriter>, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER];
        while !sinks.is_empty() {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(stream, error = %e, "read failed");
                    break;
                }
            };
            let chunk = &buf[..n];
            let written = join_all(sinks.iter_mut().map(|sink| sink.write_all(chunk))).await;
            let mut written = written.into_iter();
            sinks.retain(|_| match written.next() {
                Some(Ok(())) => true,
                Some(Err(e)) => {
                    tracing::debug!(stream, error = %e, "consumer went away before end of output");
                    false
                }
                None => false,
            });
        }
        for mut sink in sinks {
            let _ = sink.shutdown().await;
        }
    })
}

async fn next_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

async fn read_lines<R>(reader: R) -> io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut lines = Vec::new();
    while let Some(line) = next_line(&mut reader).await? {
        lines.push(line);
    }
    Ok(lines)
}

fn exit_code(status: ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => code,
        None => terminated_by_signal(status),
    }
}

fn terminated_by_signal(status: ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        128 + signal
    } else if status.core_dumped() {
        255
    } else {
        -1
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("upstream", &self.inner.program)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Environment;
    use crate::error::SPAWN_FAILURE_CODE;
    use futures::StreamExt;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn env() -> Environment {
        Environment::new()
    }

    fn cmd(env: &Environment, name: &str) -> Command {
        env.dispatch(name)
            .unwrap_or_else(|| panic!("{name} should be on PATH"))
    }

    #[tokio::test]
    async fn echo_string() {
        let env = env();
        let inv = cmd(&env, "echo").call(["hi"]);
        assert_eq!(inv.string().await.unwrap(), "hi");
        inv.await.unwrap();
    }

    #[tokio::test]
    async fn string_is_idempotent() {
        let env = env();
        let inv = cmd(&env, "printf").call(["one\ntwo\n"]);
        let first = inv.string().await.unwrap();
        inv.wait().await.unwrap();
        let second = inv.string().await.unwrap();
        assert_eq!(first, "one\ntwo");
        assert_eq!(first, second);
        assert_eq!(inv.lines().await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn lines_strip_crlf_and_keep_inner_blanks() {
        let env = env();
        let inv = cmd(&env, "printf").call(["a\r\n\nb"]);
        assert_eq!(inv.lines().await.unwrap(), vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn false_reports_exit_code() {
        let env = env();
        let failing = cmd(&env, "false");
        assert_eq!(failing.call(Vec::<Arg>::new()).code().await, 1);

        let err = failing.call(Vec::<Arg>::new()).await.unwrap_err();
        assert!(matches!(err, ShellError::Exit(1)), "got {err:?}");
    }

    #[tokio::test]
    async fn code_reports_literal_status() {
        let env = env();
        let inv = cmd(&env, "sh").call(["-c", "exit 42"]);
        assert_eq!(inv.code().await, 42);
        assert!(matches!(inv.state(), State::Failed(42)));

        let ok = cmd(&env, "true").call(Vec::<Arg>::new());
        assert_eq!(ok.code().await, 0);
        assert!(matches!(ok.state(), State::Succeeded));
    }

    #[tokio::test]
    async fn killed_process_reports_128_plus_signal() {
        let env = env();
        let inv = cmd(&env, "sh").call(["-c", "kill -9 $$"]);
        assert_eq!(inv.code().await, 128 + 9);
    }

    #[tokio::test]
    async fn pipeline_filters_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("haystack.txt");
        fs::write(&file, "hay\nneedle one\nstraw\nneedle two\nhay\n").unwrap();

        let env = env();
        let cat = cmd(&env, "cat").call([file.as_path()]);
        let grep = cat.dispatch("grep").unwrap().call(["needle"]);

        assert_eq!(grep.lines().await.unwrap(), vec!["needle one", "needle two"]);
        cat.await.unwrap();
        grep.await.unwrap();
    }

    #[tokio::test]
    async fn pipeline_preserves_bytes() {
        let env = env();
        let payload: String = (0..5000).map(|i| format!("line {i}\n")).collect();
        let upstream = cmd(&env, "printf").call(["%s", payload.as_str()]);
        let downstream = upstream.dispatch("cat").unwrap().call(Vec::<Arg>::new());

        let mut out = downstream.take_stdout().unwrap();
        let mut bytes = Vec::new();
        out.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, payload.as_bytes());
        assert_eq!(downstream.code().await, 0);
    }

    #[tokio::test]
    async fn every_chained_call_gets_a_copy() {
        let env = env();
        let upstream = cmd(&env, "echo").call(["twice"]);
        let chained = upstream.dispatch("cat").unwrap();
        assert!(chained.is_chained());

        let first = chained.call(Vec::<Arg>::new());
        let second = chained.call(Vec::<Arg>::new());
        let (first, second) = (first.string(), second.string());
        assert_eq!(first.await.unwrap(), "twice");
        assert_eq!(second.await.unwrap(), "twice");
        assert_eq!(upstream.code().await, 0);
    }

    #[tokio::test]
    async fn chained_call_after_upstream_ran_gets_empty_stdin() {
        let env = env();
        let upstream = cmd(&env, "echo").call(["early"]);
        let chained = upstream.dispatch("cat").unwrap();
        upstream.wait().await.unwrap();

        let late = chained.call(Vec::<Arg>::new());
        assert_eq!(late.string().await.unwrap(), "");
        assert_eq!(late.code().await, 0);
    }

    #[tokio::test]
    async fn chained_output_reaches_caller_and_link() {
        let env = env();
        let upstream = cmd(&env, "printf").call(["a\nb\n"]);
        let counted = upstream.dispatch("wc").unwrap().call(["-l"]);
        let own = upstream.string();
        let counted = counted.string();
        assert_eq!(own.await.unwrap(), "a\nb");
        assert_eq!(counted.await.unwrap().trim(), "2");
    }

    #[tokio::test]
    async fn nested_invocation_is_substituted() {
        let env = env();
        let inner = cmd(&env, "printf").call(["x\ny\n"]);
        let outer = cmd(&env, "printf").call([Arg::from("[%s]"), Arg::from(inner)]);
        assert_eq!(outer.string().await.unwrap(), "[x\ny]");
    }

    #[tokio::test]
    async fn substitution_ignores_nested_status() {
        let env = env();
        let inner = cmd(&env, "sh").call(["-c", "echo partial; exit 3"]);
        let outer = cmd(&env, "echo").call([inner]);
        assert_eq!(outer.string().await.unwrap(), "partial");
        assert_eq!(outer.code().await, 0);
    }

    #[tokio::test]
    async fn substitution_of_consumed_stdout_fails() {
        let env = env();
        let inner = cmd(&env, "echo").call(["gone"]);
        let _stolen = inner.take_stdout().unwrap();
        let outer = cmd(&env, "echo").call([inner]);
        let err = outer.wait().await.unwrap_err();
        assert!(matches!(err, ShellError::StreamTaken("stdout")), "got {err:?}");
    }

    #[tokio::test]
    async fn stdin_endpoint_feeds_process() {
        let env = env();
        let inv = cmd(&env, "cat").call(Vec::<Arg>::new());
        let stdin = inv.take_stdin().unwrap();
        let output = inv.string();

        stdin.write("fed through bridge\n").unwrap().await.unwrap();
        stdin.close();

        assert_eq!(output.await.unwrap(), "fed through bridge");
        assert_eq!(inv.code().await, 0);
    }

    #[tokio::test]
    async fn stderr_endpoint_captures_errors() {
        let env = env();
        let inv = cmd(&env, "sh").call(["-c", "echo oops >&2"]);
        let mut stderr = inv.take_stderr().unwrap();
        let _stdout = inv.take_stdout().unwrap();
        let mut text = String::new();
        stderr.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "oops\n");
    }

    #[tokio::test]
    async fn input_stream_argument_becomes_descriptor() {
        let env = env();
        let (writer, reader) = bridge();
        let inv = cmd(&env, "cat").call([reader]);
        let output = inv.string();

        writer.write("via fd 3\n").unwrap().await.unwrap();
        writer.close();

        assert_eq!(output.await.unwrap(), "via fd 3");
    }

    #[tokio::test]
    async fn descriptor_tokens_follow_argument_order() {
        let env = env();
        let (_w1, r1) = bridge();
        let (_w2, r2) = bridge();
        let inv = cmd(&env, "echo").call([
            Arg::from("a"),
            Arg::from(r1),
            Arg::from("b"),
            Arg::from(r2),
        ]);
        assert_eq!(inv.string().await.unwrap(), "a /dev/fd/3 b /dev/fd/4");
    }

    #[tokio::test]
    async fn output_stream_argument_receives_writes() {
        let env = env();
        let (writer, mut reader) = bridge();
        let inv = cmd(&env, "sh").call([
            Arg::from("-c"),
            Arg::from("echo aux > \"$1\""),
            Arg::from("sh"),
            Arg::from(writer),
        ]);
        let code = inv.code();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "aux\n");
        assert_eq!(code.await, 0);
    }

    #[tokio::test]
    async fn process_substitution_with_two_invocations() {
        let env = env();
        let left = cmd(&env, "printf").call(["left\n"]);
        let right = cmd(&env, "printf").call(["right\n"]);
        let both = cmd(&env, "cat").call([
            left.take_stdout().unwrap(),
            right.take_stdout().unwrap(),
        ]);
        assert_eq!(both.string().await.unwrap(), "left\nright");
        assert_eq!(both.code().await, 0);
    }

    #[tokio::test]
    async fn spawn_failure_rejects_without_exit_code() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("script");
        fs::write(&script, "#!/bin/sh\necho never\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let env = env();
        let command = env.dispatch(script.to_str().unwrap()).unwrap();
        // Permission revoked between resolution and spawn.
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();

        let inv = command.call(Vec::<Arg>::new());
        let output = inv.string();
        let err = inv.wait().await.unwrap_err();
        assert!(matches!(err, ShellError::Spawn { .. }), "got {err:?}");
        assert_eq!(inv.code().await, SPAWN_FAILURE_CODE);
        assert_eq!(output.await.unwrap(), "");
        assert!(inv.pid().is_none());
    }

    #[tokio::test]
    async fn endpoints_are_gone_after_checkpoint() {
        let env = env();
        let inv = cmd(&env, "true").call(Vec::<Arg>::new());
        inv.wait().await.unwrap();
        assert!(inv.take_stdin().is_none());
        assert!(inv.take_stdout().is_none());
        assert!(inv.take_stderr().is_none());
        assert!(matches!(inv.lines().await, Err(ShellError::StreamTaken("stdout"))));
    }

    #[tokio::test]
    async fn line_reader_streams_lazily() {
        let env = env();
        let inv = cmd(&env, "printf").call(["first\nsecond\n"]);
        let mut lines = inv.line_reader().unwrap();
        assert_eq!(lines.next().await.unwrap().unwrap(), "first");
        assert_eq!(lines.next().await.unwrap().unwrap(), "second");
        assert!(lines.next().await.is_none());
        assert!(inv.line_reader().is_none());
    }

    #[tokio::test]
    async fn pid_is_known_once_running() {
        let env = env();
        let inv = cmd(&env, "true").call(Vec::<Arg>::new());
        assert!(matches!(inv.state(), State::Pending));
        inv.wait().await.unwrap();
        assert!(inv.pid().is_some());
    }

    #[tokio::test]
    async fn dropped_invocation_still_runs() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let env = env();
        let script = format!("echo done > '{}'", marker.display());
        drop(cmd(&env, "sh").call(["-c", script.as_str()]));

        for _ in 0..500 {
            if fs::read_to_string(&marker).is_ok_and(|text| text == "done\n") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dropped invocation never ran");
    }

    #[tokio::test]
    async fn nothing_runs_until_started() {
        let env = env();
        let inv = cmd(&env, "echo").call(["later"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(inv.state(), State::Pending));
        assert!(inv.pid().is_none());

        let stdout = inv.take_stdout();
        assert!(stdout.is_some());
        inv.start();
        inv.wait().await.unwrap();
        let mut text = String::new();
        stdout.unwrap().read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "later\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attachments_survive_multi_thread_scheduling() {
        let env = env();
        for _ in 0..200 {
            let inv = cmd(&env, "echo").call(["attached"]);
            tokio::task::yield_now().await;
            assert!(inv.take_stderr().is_some());
            assert_eq!(inv.string().await.unwrap(), "attached");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pipeline_on_multi_thread_runtime() {
        let env = env();
        for _ in 0..50 {
            let upstream = cmd(&env, "printf").call(["x\ny\nx\n"]);
            let filtered = upstream.dispatch("grep").unwrap().call(["x"]);
            tokio::task::yield_now().await;
            assert_eq!(filtered.lines().await.unwrap(), vec!["x", "x"]);
        }
    }

    #[tokio::test]
    async fn children_see_exported_vars_and_cwd() {
        let dir = TempDir::new().unwrap();
        let mut env = env();
        env.set_var("PROC_SHELL_TEST_VAR", "exported");
        env.current_dir = dir.path().to_path_buf();

        let var = cmd(&env, "sh").call(["-c", "echo $PROC_SHELL_TEST_VAR"]);
        assert_eq!(var.string().await.unwrap(), "exported");

        let pwd = cmd(&env, "pwd").call(Vec::<Arg>::new());
        let reported = PathBuf::from(pwd.string().await.unwrap());
        assert_eq!(
            fs::canonicalize(reported).unwrap(),
            fs::canonicalize(dir.path()).unwrap()
        );
    }
}
