//! Descriptor-level redirection services for the dispatch loop.
//!
//! Redirections are applied by duplicating descriptors, not by threading
//! writer objects through commands: the live standard descriptor is saved,
//! the opened target is `dup2`-ed onto the standard slot, and the saved copy
//! is restored at the top of the next loop iteration. That restore is the
//! sole mechanism scoping a redirection to exactly one statement, and it is
//! what lets a sourced script's epilogue re-route the standard streams with
//! ordinary `dup2` statements.

use crate::parser::Redirections;
use crate::session::Session;
use anyhow::{Context, Result, bail};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::MetadataExt;

/// Longest input line the raw reader will accumulate before forcing a break.
pub(crate) const MAX_LINE: usize = 4 * 4096;

/// Duplicate a descriptor, returning the new one.
pub(crate) fn dup(fd: RawFd) -> std::io::Result<RawFd> {
    let new = unsafe { libc::dup(fd) };
    if new < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(new)
}

/// Duplicate `old` onto `new`, silently closing whatever `new` held.
pub(crate) fn dup2(old: RawFd, new: RawFd) -> std::io::Result<()> {
    if unsafe { libc::dup2(old, new) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Close a descriptor.
pub(crate) fn close(fd: RawFd) -> std::io::Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// True when standard input is attached to a terminal.
pub(crate) fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// Duplicates of the standard streams taken immediately before a redirection
/// was applied. An entry exists only while a redirection for that stream is
/// active; restoring tears the whole set down.
#[derive(Debug, Default)]
pub struct SavedStreams {
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
}

impl SavedStreams {
    /// True when any stream is currently redirected.
    pub fn any_saved(&self) -> bool {
        self.stdin.is_some() || self.stdout.is_some() || self.stderr.is_some()
    }

    /// True when standard input specifically is redirected. The `source`
    /// builtin uses this to reject a simultaneous input redirection.
    pub fn stdin_saved(&self) -> bool {
        self.stdin.is_some()
    }

    /// The shell-level stdout: the saved descriptor when a redirection is
    /// active on the current statement, otherwise `fallback`.
    pub fn stdout_or(&self, fallback: RawFd) -> RawFd {
        self.stdout.unwrap_or(fallback)
    }

    /// The shell-level stderr, by the same rule as [`Self::stdout_or`].
    pub fn stderr_or(&self, fallback: RawFd) -> RawFd {
        self.stderr.unwrap_or(fallback)
    }

    /// Restore every saved stream onto its standard slot and discard the set.
    pub fn restore_all(&mut self) {
        for (saved, slot) in [
            (self.stdin.take(), libc::STDIN_FILENO),
            (self.stdout.take(), libc::STDOUT_FILENO),
            (self.stderr.take(), libc::STDERR_FILENO),
        ] {
            if let Some(fd) = saved {
                if let Err(e) = dup2(fd, slot) {
                    log::warn!("restoring fd {} failed: {}", slot, e);
                }
                let _ = close(fd);
            }
        }
    }
}

/// Install `file` as the standard descriptor `slot`, saving the previous
/// descriptor into `saved`. The opened descriptor itself is closed once
/// duplicated onto the slot.
fn install(file: File, slot: RawFd, saved: &mut Option<RawFd>) -> std::io::Result<()> {
    let backup = dup(slot)?;
    if let Err(e) = dup2(file.as_raw_fd(), slot) {
        let _ = close(backup);
        return Err(e);
    }
    *saved = Some(backup);
    Ok(())
}

/// True when both paths name the same underlying file (device and inode).
/// Nonexistent paths never match anything.
pub fn same_file(a: &str, b: &str) -> bool {
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

/// Reject statements that read and write the same file, before any byte is
/// transferred.
fn check_same_file(redir: &Redirections) -> Result<()> {
    if let Some(input) = &redir.input {
        for out in [&redir.output, &redir.append, &redir.error].into_iter().flatten() {
            if same_file(input, out) {
                bail!("input file is output file");
            }
        }
    }
    Ok(())
}

/// Apply every redirection of one statement.
///
/// On failure the statement must be aborted; descriptors redirected earlier
/// in the same statement stay in place and are cleaned up passively by the
/// restore at the next loop iteration.
pub fn apply(redir: &Redirections, session: &mut Session) -> Result<()> {
    check_same_file(redir)?;

    if let Some(path) = &redir.input {
        let f = File::open(path).with_context(|| format!("stdin redirection '<' from '{}'", path))?;
        install(f, libc::STDIN_FILENO, &mut session.saved.stdin)
            .context("installing stdin redirection")?;
        log::debug!("stdin redirected from {}", path);
    }

    if let Some(path) = &redir.output {
        let f = File::create(path).with_context(|| format!("stdout redirection '>' to '{}'", path))?;
        install(f, libc::STDOUT_FILENO, &mut session.saved.stdout)
            .context("installing stdout redirection")?;
        log::debug!("stdout redirected to {}", path);
    }

    if let Some(path) = &redir.append {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("append redirection '>>' to '{}'", path))?;
        install(f, libc::STDOUT_FILENO, &mut session.saved.stdout)
            .context("installing append redirection")?;
        log::debug!("stdout appending to {}", path);
    }

    if let Some(path) = &redir.error {
        let f = File::create(path).with_context(|| format!("stderr redirection '2>' to '{}'", path))?;
        install(f, libc::STDERR_FILENO, &mut session.saved.stderr)
            .context("installing stderr redirection")?;
        log::debug!("stderr redirected to {}", path);
    }

    if let Some(tag) = &redir.heredoc {
        let f = materialize_heredoc(tag).context("heredoc redirection '<<'")?;
        install(f, libc::STDIN_FILENO, &mut session.saved.stdin)
            .context("installing heredoc redirection")?;
        log::debug!("stdin redirected from heredoc up to '{}'", tag);
    }

    Ok(())
}

/// Read one line from the live standard input, one byte at a time.
///
/// Byte-wise reads matter: standard input may be swapped out from under the
/// loop (heredocs, sourced scripts), and a buffered reader would carry stolen
/// bytes across the swap. Returns `None` at end of input with nothing read.
pub(crate) fn read_raw_line() -> std::io::Result<Option<String>> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = unsafe { libc::read(libc::STDIN_FILENO, byte.as_mut_ptr().cast(), 1) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if n == 0 {
            if bytes.is_empty() {
                return Ok(None);
            }
            break;
        }
        bytes.push(byte[0]);
        if byte[0] == b'\n' || bytes.len() >= MAX_LINE - 1 {
            break;
        }
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// True when `line` is exactly the heredoc terminator, ignoring only a
/// trailing newline.
pub(crate) fn is_terminator(line: &str, tag: &str) -> bool {
    line.strip_suffix('\n').unwrap_or(line) == tag
}

/// Materialize a heredoc: copy lines from the current standard input into an
/// anonymous temporary file until the terminator line, then rewind it so it
/// can be installed as stdin.
fn materialize_heredoc(tag: &str) -> Result<File> {
    let mut tmp = tempfile::tempfile().context("opening heredoc scratch file")?;
    while let Some(line) = read_raw_line()? {
        if is_terminator(&line, tag) {
            break;
        }
        tmp.write_all(line.as_bytes())?;
    }
    tmp.seek(SeekFrom::Start(0))?;
    Ok(tmp)
}

/// Leak a file into the shell's descriptor table, returning the raw
/// descriptor. Used by the script sourcer, whose epilogue closes the
/// descriptor by number once the script has run.
pub(crate) fn into_table(file: File) -> RawFd {
    file.into_raw_fd()
}
