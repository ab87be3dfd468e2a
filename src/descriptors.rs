//! Auxiliary descriptor channels for stream-valued arguments.
//!
//! Each stream argument becomes an OS pipe. The child's end is mapped into the
//! child's descriptor table at slot `3 + index` and the argument is rendered as
//! `/dev/fd/<slot>`; the parent's end is pumped to or from the caller's stream.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// First descriptor slot after stdin, stdout and stderr.
pub const FIRST_AUX_FD: RawFd = 3;

/// Token the spawned process sees in place of a stream argument.
pub fn fd_token(slot: RawFd) -> String {
    format!("/dev/fd/{slot}")
}

/// A stream argument waiting to be wired to the child.
pub(crate) enum AuxStream {
    /// The child reads from the descriptor; bytes come from this reader.
    Input(Box<dyn AsyncRead + Send + Unpin>),
    /// The child writes to the descriptor; bytes go to this writer.
    Output(Box<dyn AsyncWrite + Send + Unpin>),
}

enum AuxPump {
    Feed {
        source: Box<dyn AsyncRead + Send + Unpin>,
        sink: pipe::Sender,
    },
    Drain {
        source: pipe::Receiver,
        sink: Box<dyn AsyncWrite + Send + Unpin>,
    },
}

/// Pipes allocated for one spawn.
pub(crate) struct AuxPlan {
    /// Child ends, duplicated above the target slot range.
    child_fds: Vec<OwnedFd>,
    pumps: Vec<AuxPump>,
}

/// Background copies started for a spawned child.
#[derive(Default)]
pub(crate) struct AuxTasks {
    /// Copies into the child; aborted once the child exits.
    pub feeders: Vec<JoinHandle<()>>,
    /// Copies out of the child; awaited before the invocation settles.
    pub drainers: Vec<JoinHandle<()>>,
}

impl AuxPlan {
    /// Allocate one pipe per stream. Must run inside a tokio runtime.
    pub fn allocate(streams: Vec<AuxStream>) -> io::Result<Self> {
        let floor = FIRST_AUX_FD + streams.len() as RawFd;
        let mut child_fds = Vec::with_capacity(streams.len());
        let mut pumps = Vec::with_capacity(streams.len());

        for stream in streams {
            let (read_end, write_end) = std::io::pipe()?;
            match stream {
                AuxStream::Input(source) => {
                    child_fds.push(dup_above(OwnedFd::from(read_end), floor)?);
                    let sink = pipe::Sender::from_owned_fd(OwnedFd::from(write_end))?;
                    pumps.push(AuxPump::Feed { source, sink });
                }
                AuxStream::Output(sink) => {
                    child_fds.push(dup_above(OwnedFd::from(write_end), floor)?);
                    let source = pipe::Receiver::from_owned_fd(OwnedFd::from(read_end))?;
                    pumps.push(AuxPump::Drain { source, sink });
                }
            }
        }

        Ok(Self { child_fds, pumps })
    }

    pub fn is_empty(&self) -> bool {
        self.child_fds.is_empty()
    }

    /// Arrange for the child ends to land on slots `3..` in the child.
    pub fn install(&self, cmd: &mut Command) {
        if self.is_empty() {
            return;
        }
        let moves: Vec<(RawFd, RawFd)> = self
            .child_fds
            .iter()
            .enumerate()
            .map(|(i, fd)| (fd.as_raw_fd(), FIRST_AUX_FD + i as RawFd))
            .collect();

        // SAFETY: the closure only calls dup2, which is async-signal-safe, and
        // does not allocate. Sources sit above every target slot, so no move
        // clobbers a source that is still needed.
        unsafe {
            cmd.pre_exec(move || {
                for &(src, dst) in &moves {
                    if libc::dup2(src, dst) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    /// Start the copy tasks. Drops the parent's copies of the child ends so
    /// the child holds the only reference and end-of-stream propagates.
    pub fn start(self) -> AuxTasks {
        drop(self.child_fds);
        let mut tasks = AuxTasks::default();
        for (i, pump) in self.pumps.into_iter().enumerate() {
            let slot = FIRST_AUX_FD + i as RawFd;
            match pump {
                AuxPump::Feed { mut source, mut sink } => {
                    tasks.feeders.push(tokio::spawn(async move {
                        if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
                            tracing::debug!(slot, error = %e, "auxiliary input closed early");
                        }
                    }));
                }
                AuxPump::Drain { mut source, mut sink } => {
                    tasks.drainers.push(tokio::spawn(async move {
                        if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
                            tracing::debug!(slot, error = %e, "auxiliary output copy failed");
                        }
                        let _ = sink.shutdown().await;
                    }));
                }
            }
        }
        tasks
    }
}

/// Duplicate `fd` onto the lowest free descriptor `>= floor`, close-on-exec.
fn dup_above(fd: OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: `fd` is a valid open descriptor for the duration of the call.
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
