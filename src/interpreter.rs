//! Thin interactive front end over the dispatch surface.
//!
//! A line is split on whitespace into a command name and text arguments; no
//! quoting, pipes or redirections are parsed. Unclaimed streams of every
//! invocation fall back to the terminal, so output appears as it is produced.

use crate::command::{Arg, ExitCode};
use crate::env::{Binding, Environment};
use crate::error::SPAWN_FAILURE_CODE;
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::fs;
use std::path::PathBuf;

const HISTORY_FILE: &str = ".proc_shell_history";

/// Built-in commands handled by the front end itself.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and change the
/// session [`Environment`] rather than spawning a process.
trait Builtin: Sized + FromArgs {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    fn execute(self, env: &mut Environment) -> Result<ExitCode>;
}

#[derive(FromArgs)]
/// Change the working directory of subsequently spawned processes.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory.
    /// Defaults to $HOME when omitted.
    target: Option<String>,
}

impl Builtin for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode> {
        let target = match &self.target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => PathBuf::from(env.get_var("HOME").context("cd: no target and HOME not set")?),
        };

        let new_dir = if target.is_absolute() {
            target
        } else {
            env.current_dir.join(target)
        };

        let canonical = fs::canonicalize(&new_dir)
            .with_context(|| format!("cd: can't canonicalize {}", new_dir.display()))?;
        anyhow::ensure!(canonical.is_dir(), "cd: not a directory: {}", canonical.display());
        env.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Export variables to spawned processes.
struct Export {
    #[argh(positional, greedy)]
    /// assignments in NAME=VALUE form.
    assignments: Vec<String>,
}

impl Builtin for Export {
    fn name() -> &'static str {
        "export"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode> {
        for assignment in self.assignments {
            let (name, value) = assignment
                .split_once('=')
                .with_context(|| format!("export: expected NAME=VALUE, got {assignment}"))?;
            anyhow::ensure!(!name.is_empty(), "export: empty variable name");
            env.set_var(name, value);
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Bind a name to text in the session namespace.
struct Let {
    #[argh(positional)]
    /// name to bind.
    name: String,
    #[argh(positional, greedy)]
    /// words forming the value, joined by single spaces.
    value: Vec<String>,
}

impl Builtin for Let {
    fn name() -> &'static str {
        "let"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode> {
        env.define(self.name, Binding::Text(self.value.join(" ")));
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Leave the interactive session.
struct Exit {
    #[argh(positional, greedy)]
    /// ignored.
    _args: Vec<String>,
}

impl Builtin for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, env: &mut Environment) -> Result<ExitCode> {
        env.should_exit = true;
        Ok(0)
    }
}

/// Parse and run `T` if `name` matches it. `None` when it does not.
fn try_builtin<T: Builtin>(
    env: &mut Environment,
    name: &str,
    args: &[&str],
) -> Option<Result<ExitCode>> {
    if name != T::name() {
        return None;
    }
    Some(match T::from_args(&[name], args) {
        Ok(cmd) => cmd.execute(env),
        Err(EarlyExit { output, status }) => {
            if status.is_err() {
                eprintln!("{output}");
                Ok(1)
            } else {
                println!("{output}");
                Ok(0)
            }
        }
    })
}

/// A session: an [`Environment`] plus the line-oriented front end.
///
/// Example
/// ```no_run
/// use proc_shell::Interpreter;
/// # async fn demo() -> anyhow::Result<()> {
/// let mut sh = Interpreter::default();
/// let code = sh.run("echo", &["hello", "world"]).await?;
/// assert_eq!(code, 0);
/// # Ok(())
/// # }
/// ```
pub struct Interpreter {
    env: Environment,
}

impl Interpreter {
    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// Run a single command by name with text arguments.
    ///
    /// Builtins are tried first, then session bindings, then the search path.
    /// Streams are left unclaimed so they fall back to the terminal. Unknown
    /// commands report 127.
    pub async fn run(&mut self, name: &str, args: &[&str]) -> Result<ExitCode> {
        let env = &mut self.env;
        let builtin = try_builtin::<Cd>(env, name, args)
            .or_else(|| try_builtin::<Export>(env, name, args))
            .or_else(|| try_builtin::<Let>(env, name, args))
            .or_else(|| try_builtin::<Exit>(env, name, args));
        if let Some(result) = builtin {
            return result;
        }

        match self.env.get(name) {
            Some(Binding::Command(cmd)) => {
                let inv = cmd.call(args.iter().map(|&a| Arg::from(a)));
                Ok(inv.code().await)
            }
            Some(Binding::Text(text)) => {
                println!("{text}");
                Ok(0)
            }
            None => {
                eprintln!("{name}: command not found");
                Ok(SPAWN_FAILURE_CODE)
            }
        }
    }

    /// Split `line` on whitespace and run it. Blank lines succeed trivially.
    pub async fn execute_line(&mut self, line: &str) -> Result<ExitCode> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.split_first() {
            Some((name, args)) => self.run(name, args).await,
            None => Ok(0),
        }
    }

    /// Interactive read-eval-print loop with line editing and history.
    ///
    /// Each line runs to completion on `runtime` before the next prompt.
    /// History is persisted to `$HOME/.proc_shell_history` when `HOME` is set.
    pub fn repl(&mut self, runtime: &tokio::runtime::Runtime) -> Result<()> {
        let mut rl = DefaultEditor::new().context("failed to create line editor")?;
        let history = self.env.get_var("HOME").map(|home| PathBuf::from(home).join(HISTORY_FILE));
        if let Some(path) = &history {
            if let Err(e) = rl.load_history(path) {
                tracing::debug!(error = %e, "no history loaded");
            }
        }

        while !self.env.should_exit {
            match rl.readline("> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    rl.add_history_entry(line.as_str())?;
                    match runtime.block_on(self.execute_line(&line)) {
                        Ok(0) => {}
                        Ok(code) => eprintln!("[exit {code}]"),
                        Err(e) => eprintln!("{e:#}"),
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err).context("failed to read line"),
            }
        }

        if let Some(path) = &history {
            if let Err(e) = rl.save_history(path) {
                tracing::warn!(error = %e, "failed to save history");
            }
        }
        Ok(())
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(Environment::new())
    }
}
