use crate::command::ExitCode;
use crate::redirect::SavedStreams;
use std::collections::HashMap;
use std::env as stdenv;
use std::path::PathBuf;

/// How the prompt is rendered between statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// No prompt at all.
    Silent,
    /// A fixed marker, independent of shell state.
    Fixed,
    /// The current working directory (the default).
    WorkingDir,
}

impl PromptMode {
    /// Numeric encoding used by the `prompt` builtin: 0, 1 or anything else.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PromptMode::Silent,
            1 => PromptMode::Fixed,
            _ => PromptMode::WorkingDir,
        }
    }
}

/// The one explicit session object threaded through every component.
///
/// Everything that outlives a single statement lives here: the variable map
/// and working directory visible to commands and serialized into spawned
/// images, the not-yet-tokenized tail of a multi-statement line, the saved
/// descriptor set that scopes a redirection to exactly one statement, the
/// previous statement's exit status (for `$?`), and the prompt mode. There is
/// no session state outside this struct.
#[derive(Debug)]
pub struct Session {
    /// Key-value store of environment variables (e.g. PATH, HOME).
    pub vars: HashMap<String, String>,
    /// The current working directory for command execution.
    pub current_dir: PathBuf,
    /// When set, the dispatch loop terminates after the current statement.
    pub should_exit: bool,
    /// Status the loop reports when `should_exit` is set.
    pub exit_status: ExitCode,
    /// Exit status of the most recently completed statement (`$?`).
    pub last_status: ExitCode,
    /// Remainder of a multi-statement input line, not yet tokenized.
    pub pending: Option<String>,
    /// Duplicates of the standard streams taken when a redirection was
    /// applied; restored and discarded at the top of the next loop iteration.
    pub saved: SavedStreams,
    /// Prompt rendering mode.
    pub prompt: PromptMode,
}

impl Session {
    /// Capture the current process state into a new `Session`.
    ///
    /// Copies variables from `std::env::vars()` and initializes
    /// `current_dir` from `std::env::current_dir()`.
    pub fn new() -> Self {
        let mut vars = HashMap::new();
        for (k, v) in stdenv::vars() {
            vars.insert(k, v);
        }
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            vars,
            current_dir,
            should_exit: false,
            exit_status: 0,
            last_status: 0,
            pending: None,
            saved: SavedStreams::default(),
            prompt: PromptMode::WorkingDir,
        }
    }

    /// Get the value of a session variable.
    ///
    /// Looks up the key in `self.vars` first, falling back to `std::env::var`.
    pub fn get_var(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .cloned()
            .or_else(|| stdenv::var(key).ok())
    }

    /// Set or override a session variable.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Remove a session variable. Removing an absent key is not an error.
    pub fn unset_var(&mut self, key: &str) {
        self.vars.remove(key);
    }

    /// Session variables as `KEY=value` pairs in serialization order.
    ///
    /// This is the list the program loader writes into an image's
    /// environment block. Sorted so that identical sessions always produce
    /// identical images.
    pub fn environ(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.sort();
        pairs
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_var() {
        let mut session = Session::new();

        assert_eq!(session.get_var("SOME_RANDOM_VMSH_VAR_12345"), None);

        session.set_var("KEY", "VALUE");
        assert_eq!(session.get_var("KEY"), Some("VALUE".to_string()));

        session.unset_var("KEY");
        assert_eq!(session.get_var("KEY"), None);
    }

    #[test]
    fn test_reads_from_process_env() {
        let session = Session::new();
        assert!(session.get_var("PATH").is_some());
    }

    #[test]
    fn test_environ_is_sorted_pairs() {
        let mut session = Session::new();
        session.vars.clear();
        session.set_var("B", "2");
        session.set_var("A", "1");
        assert_eq!(session.environ(), vec!["A=1".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn test_prompt_mode_codes() {
        assert_eq!(PromptMode::from_code(0), PromptMode::Silent);
        assert_eq!(PromptMode::from_code(1), PromptMode::Fixed);
        assert_eq!(PromptMode::from_code(2), PromptMode::WorkingDir);
        assert_eq!(PromptMode::from_code(7), PromptMode::WorkingDir);
    }
}
