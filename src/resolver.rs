use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Ordered list of directories searched for executables.
///
/// Captured once (usually from `PATH`) and never reloaded. Directory contents
/// are not cached, so every [`SearchPath::resolve`] call sees the filesystem
/// as it is at that moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Build a search path from an explicit list of directories.
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs
                .into_iter()
                .map(Into::into)
                .filter(|dir: &PathBuf| !dir.as_os_str().is_empty())
                .collect(),
        }
    }

    /// Parse a colon-separated list such as the value of `PATH`.
    pub fn parse(value: &OsStr) -> Self {
        Self::new(std::env::split_paths(value))
    }

    /// Read `PATH` from the process environment. An unset `PATH` yields an empty list.
    pub fn from_env() -> Self {
        match std::env::var_os("PATH") {
            Some(value) => Self::parse(&value),
            None => Self::default(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Resolve a command name the way the dispatch surface expects.
    ///
    /// Behavior:
    /// - Names containing `/` or starting with `.` are direct paths: returned
    ///   as given if they point at an executable file.
    /// - Any other name is looked up in each directory in order and the first
    ///   executable `dir/name` wins.
    /// - An empty name never resolves.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }

        if is_direct(name) {
            let path = Path::new(name);
            return is_executable(path).then(|| path.to_path_buf());
        }

        let found = self
            .dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate));
        tracing::trace!(name, found = ?found, "searched path for command");
        found
    }
}

/// Whether `name` is treated as a path rather than looked up in the search list.
pub fn is_direct(name: &str) -> bool {
    name.starts_with('.') || name.contains('/')
}

/// Whether `path` names an existing, non-directory file the current user may execute.
///
/// Only performs `stat`/`access` checks; the file is never opened.
pub fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(meta) if !meta.is_dir() => {}
        _ => return false,
    }

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_file(path: &Path, mode: u32) {
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(path, "#!/bin/sh\nexit 0\n").expect("write file");
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("chmod");
    }

    #[test]
    fn finds_echo_in_usr_bin() {
        let root = TempDir::new().expect("tempdir");
        let usr_bin = root.path().join("usr/bin");
        write_file(&usr_bin.join("echo"), 0o755);

        let search = SearchPath::new([&usr_bin]);
        assert_eq!(search.resolve("echo"), Some(usr_bin.join("echo")));
    }

    #[test]
    fn first_directory_in_order_wins() {
        let root = TempDir::new().expect("tempdir");
        let first = root.path().join("first");
        let second = root.path().join("second");
        write_file(&first.join("tool"), 0o755);
        write_file(&second.join("tool"), 0o755);

        let search = SearchPath::new([&first, &second]);
        assert_eq!(search.resolve("tool"), Some(first.join("tool")));

        let reversed = SearchPath::new([&second, &first]);
        assert_eq!(reversed.resolve("tool"), Some(second.join("tool")));
    }

    #[test]
    fn non_executable_entries_are_skipped() {
        let root = TempDir::new().expect("tempdir");
        let first = root.path().join("first");
        let second = root.path().join("second");
        write_file(&first.join("tool"), 0o644);
        write_file(&second.join("tool"), 0o755);

        let search = SearchPath::new([&first, &second]);
        assert_eq!(search.resolve("tool"), Some(second.join("tool")));
    }

    #[test]
    fn directories_are_not_executables() {
        let root = TempDir::new().expect("tempdir");
        fs::create_dir_all(root.path().join("tool")).expect("mkdir");

        let search = SearchPath::new([root.path()]);
        assert_eq!(search.resolve("tool"), None);
    }

    #[test]
    fn lookup_is_not_cached() {
        let root = TempDir::new().expect("tempdir");
        let search = SearchPath::new([root.path()]);
        assert_eq!(search.resolve("late"), None);

        write_file(&root.path().join("late"), 0o755);
        assert_eq!(search.resolve("late"), Some(root.path().join("late")));
    }

    #[test]
    fn direct_paths_bypass_search() {
        let root = TempDir::new().expect("tempdir");
        let script = root.path().join("script");
        write_file(&script, 0o755);
        let name = script.to_str().expect("utf8 path");

        let empty = SearchPath::default();
        assert_eq!(empty.resolve(name), Some(script.clone()));

        let missing = root.path().join("missing");
        assert_eq!(empty.resolve(missing.to_str().expect("utf8 path")), None);
    }

    #[test]
    fn path_like_names_are_direct() {
        assert!(is_direct("./foo"));
        assert!(is_direct("/bin/sh"));
        assert!(is_direct("bin/sh"));
        assert!(is_direct(".hidden"));
        assert!(!is_direct("sh"));
    }

    #[test]
    fn empty_name_is_none() {
        let search = SearchPath::new(["/bin", "/usr/bin"]);
        assert_eq!(search.resolve(""), None);
    }

    #[test]
    fn parse_skips_empty_entries() {
        let search = SearchPath::parse(OsStr::new("/a::/b:"));
        assert_eq!(search.dirs(), &[PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
