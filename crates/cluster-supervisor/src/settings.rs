// Spawn settings: what program a worker runs and how.

use std::path::PathBuf;

use serde::Serialize;

/// Options accepted by `Supervisor::setup_master`. Unset fields fall back
/// to the supervisor process's own invocation.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Program the workers execute.
    pub exec: Option<PathBuf>,
    /// Runtime flags placed before the program arguments.
    pub exec_argv: Option<Vec<String>>,
    /// Program arguments.
    pub args: Option<Vec<String>>,
    /// Pipe the workers' standard streams instead of inheriting them.
    pub silent: Option<bool>,
}

/// Immutable spawn settings, captured by the first `setup_master` call.
/// Later setup calls do not touch them.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub exec: PathBuf,
    pub exec_argv: Vec<String>,
    pub args: Vec<String>,
    pub silent: bool,
}

impl Settings {
    pub(crate) fn capture(options: SetupOptions) -> Self {
        Settings {
            exec: options.exec.unwrap_or_else(own_executable),
            exec_argv: options.exec_argv.unwrap_or_default(),
            args: options
                .args
                .unwrap_or_else(|| std::env::args().skip(1).collect()),
            silent: options.silent.unwrap_or(false),
        }
    }
}

fn own_executable() -> PathBuf {
    std::env::current_exe().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_mirror_own_invocation() {
        let settings = Settings::capture(SetupOptions::default());
        assert_eq!(settings.exec, std::env::current_exe().unwrap());
        assert!(settings.exec_argv.is_empty());
        assert!(!settings.silent);
    }

    #[test]
    fn test_explicit_options_win() {
        let settings = Settings::capture(SetupOptions {
            exec: Some(PathBuf::from("/usr/bin/worker")),
            exec_argv: Some(vec!["--quiet".into()]),
            args: Some(vec!["serve".into()]),
            silent: Some(true),
        });
        assert_eq!(settings.exec, PathBuf::from("/usr/bin/worker"));
        assert_eq!(settings.exec_argv, vec!["--quiet"]);
        assert_eq!(settings.args, vec!["serve"]);
        assert!(settings.silent);
    }
}
