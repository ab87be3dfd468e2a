//! Run executables found on the search path as composable, awaitable values.
//!
//! A [`Command`] is obtained by name from an [`Environment`] and called with a
//! list of [`Arg`]s to start an [`Invocation`]. Invocations compose without any
//! shell grammar:
//!
//! - passing an invocation as an argument substitutes its captured stdout;
//! - passing a stream endpoint hands the process a `/dev/fd/N` path;
//! - [`Invocation::dispatch`] pipes one invocation's stdout into the next.
//!
//! ```no_run
//! use proc_shell::Environment;
//! # async fn demo() -> Result<(), proc_shell::ShellError> {
//! let env = Environment::new();
//! let cat = env.dispatch("cat").expect("cat on PATH").call(["notes.txt"]);
//! let todo = cat.dispatch("grep").expect("grep on PATH").call(["TODO"]);
//! for line in todo.lines().await? {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The public modules [`bridge`] and [`resolver`] expose the channel pair used
//! for process streams and the executable lookup on their own.

pub mod bridge;
mod command;
mod descriptors;
mod env;
mod error;
mod interpreter;
mod invocation;
pub mod resolver;

pub use command::{Arg, Command, ExitCode};
pub use descriptors::fd_token;
pub use env::{Binding, Environment};
pub use error::{BridgeError, SPAWN_FAILURE_CODE, ShellError};
pub use interpreter::Interpreter;
pub use invocation::{Invocation, State};
