use crate::command::{Command, SpawnContext};
use crate::resolver::SearchPath;
use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;
use std::sync::Arc;

/// A value bound to a name in an [`Environment`].
#[derive(Debug, Clone)]
pub enum Binding {
    /// Plain text defined by the session.
    Text(String),
    /// A callable that starts invocations.
    Command(Command),
}

/// Session namespace and the command dispatch surface.
///
/// The environment contains:
/// - `vars`: environment variables passed to every spawned process.
/// - `current_dir`: the working directory of spawned processes.
/// - `should_exit`: a flag that a REPL loop can check to know when to terminate.
/// - the search path, captured once at creation.
/// - names bound by the session, which shadow executables of the same name.
///
/// An environment lives as long as the front end session that created it;
/// nothing here is global.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Key-value store of environment variables (e.g., PATH, HOME).
    pub vars: HashMap<String, String>,
    /// The current working directory for command execution.
    pub current_dir: PathBuf,
    /// When set to true, indicates that an interactive loop should exit.
    pub should_exit: bool,
    search_path: SearchPath,
    bindings: HashMap<String, Binding>,
}

impl Environment {
    /// Capture the current process state into a new `Environment` instance.
    ///
    /// Copies variables from `std::env::vars()`, reads `PATH` into the search
    /// path and takes `current_dir` from `std::env::current_dir()`.
    pub fn new() -> Self {
        Self::with_search_path(SearchPath::from_env())
    }

    /// Like [`Environment::new`], but with an explicit search path.
    pub fn with_search_path(search_path: SearchPath) -> Self {
        let vars = stdenv::vars().collect();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            vars,
            current_dir,
            should_exit: false,
            search_path,
            bindings: HashMap::new(),
        }
    }

    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    /// Get the value of an environment variable.
    ///
    /// Looks up the key in `self.vars` first, falling back to `std::env::var`.
    pub fn get_var(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .cloned()
            .or_else(|| stdenv::var(key).ok())
    }

    /// Set or override an environment variable in `self.vars`.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Bind `name` in the session namespace, shadowing any executable.
    pub fn define(&mut self, name: impl Into<String>, binding: Binding) {
        self.bindings.insert(name.into(), binding);
    }

    /// Remove a session binding, returning it.
    pub fn remove(&mut self, name: &str) -> Option<Binding> {
        self.bindings.remove(name)
    }

    /// True if `name` is bound or resolves to an executable.
    pub fn has(&self, name: &str) -> bool {
        self.bindings.contains_key(name) || self.search_path.resolve(name).is_some()
    }

    /// The bound value for `name`, or a command for the executable it resolves to.
    pub fn get(&self, name: &str) -> Option<Binding> {
        if let Some(binding) = self.bindings.get(name) {
            return Some(binding.clone());
        }
        self.dispatch(name).map(Binding::Command)
    }

    /// Resolve `name` against the search path and return a callable command.
    ///
    /// Resolution failure is not an error: callers check for `None` before
    /// invoking. Session bindings are not consulted.
    pub fn dispatch(&self, name: &str) -> Option<Command> {
        let program = self.search_path.resolve(name)?;
        tracing::debug!(name, program = %program.display(), "resolved command");
        Some(Command::new(program, Arc::new(self.spawn_context()), None))
    }

    fn spawn_context(&self) -> SpawnContext {
        SpawnContext {
            search_path: self.search_path.clone(),
            current_dir: Some(self.current_dir.clone()),
            vars: self.vars.clone(),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
