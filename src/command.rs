use crate::session::Session;
use anyhow::Result;
use std::io::{Read, Write};

/// Conventional exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line
/// tools. A spawn that never reaches execution reports a negative value.
pub type ExitCode = i32;

/// Object-safe trait for any command that can be executed by the shell.
///
/// This is implemented by built-ins via a blanket impl, by the implicit
/// spawn of an executable file, and by the engine-backed commands.
///
/// Commands receive the live standard streams. Redirections are applied at
/// the descriptor level before a command runs, so writing to `stdout` already
/// goes wherever the current statement's redirections point it.
pub trait ExecutableCommand {
    /// Executes the command.
    fn execute(
        self: Box<Self>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode>;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
/// Implementations can use the session to resolve names (e.g. checking the
/// filesystem for an executable candidate).
pub trait CommandFactory {
    /// Attempt to create a command instance for the provided name and arguments.
    fn try_create(
        &self,
        session: &Session,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>>;
}
