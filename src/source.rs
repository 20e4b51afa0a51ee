//! Script sourcing without a nested interpreter.
//!
//! A sourced script is not executed by recursing into a second dispatch
//! loop. Instead a scratch file is built around the script: a preamble that
//! re-routes stdout/stderr to the streams in effect when `source` ran, the
//! verbatim script bytes, and a one-line epilogue that restores the standard
//! streams and closes every temporary descriptor. That file is installed
//! as standard input. The main loop then simply keeps reading statements and
//! consumes the script as if the user had typed it.

use crate::command::ExitCode;
use crate::redirect::{self, into_table};
use crate::session::Session;
use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::RawFd;

/// Descriptors woven into the wrapper text.
struct WrapperFds {
    /// Copy of the interactive stdin to restore at the end.
    stdin0: RawFd,
    /// Copies of the stdout/stderr in effect while `source` runs; the
    /// preamble re-applies them for the whole script, surviving the
    /// per-statement restore of the main loop.
    source_out: RawFd,
    source_err: RawFd,
    /// Copies of the shell-level stdout/stderr from before any redirection
    /// on the `source` statement itself.
    shell_out: RawFd,
    shell_err: RawFd,
    /// The scratch file's own descriptor, closed by the epilogue.
    script: RawFd,
}

fn preamble_text(fds: &WrapperFds) -> String {
    format!(
        "# preamble ===========\n\
         dup2 {} 1 -s\n\
         dup2 {} 2 -s\n\
         #=====================\n",
        fds.source_out, fds.source_err
    )
}

/// The epilogue must be a single `;`-separated line: once the first `dup2`
/// restores standard input, no further statement can be read from the
/// scratch file.
fn epilogue_text(fds: &WrapperFds) -> String {
    format!(
        "\n# epilogue ===========\n\
         dup2 {in0} 0 -s ;\
         close {in0} -s ;\
         close {script} -s ;\
         dup2 {sh_out} 1 -s ;\
         dup2 {sh_err} 2 -s ;\
         close {sh_out} -s ;\
         close {sh_err} -s ;\
         close {src_out} -s ;\
         close {src_err} -s\n",
        in0 = fds.stdin0,
        script = fds.script,
        sh_out = fds.shell_out,
        sh_err = fds.shell_err,
        src_out = fds.source_out,
        src_err = fds.source_err,
    )
}

/// Run `path` as a script of statements on the current interpreter.
///
/// Fails without side effects when the script cannot be opened, when scratch
/// space is unavailable, or when the statement carries its own `<`/`<<`
/// redirection, because standard input is the channel used to inject the script, so
/// it cannot also be redirected.
pub fn source_script(path: &str, session: &mut Session) -> Result<ExitCode> {
    if session.saved.stdin_saved() {
        bail!("the source command does not accept input redirection");
    }

    let mut script = File::open(path).with_context(|| format!("opening script '{}'", path))?;

    let mut tmp = tempfile::tempfile().context("opening sourcing scratch file")?;

    // Duplicate everything the wrapper will refer to by number. These copies
    // live in the shell's descriptor table until the epilogue closes them.
    let fds = WrapperFds {
        stdin0: redirect::dup(libc::STDIN_FILENO)?,
        source_out: redirect::dup(libc::STDOUT_FILENO)?,
        source_err: redirect::dup(libc::STDERR_FILENO)?,
        shell_out: redirect::dup(session.saved.stdout_or(libc::STDOUT_FILENO))?,
        shell_err: redirect::dup(session.saved.stderr_or(libc::STDERR_FILENO))?,
        script: {
            use std::os::fd::AsRawFd;
            tmp.as_raw_fd()
        },
    };

    let teardown = |fds: &WrapperFds| {
        for fd in [fds.stdin0, fds.source_out, fds.source_err, fds.shell_out, fds.shell_err] {
            let _ = redirect::close(fd);
        }
    };

    let build = (|| -> Result<()> {
        tmp.write_all(preamble_text(&fds).as_bytes())?;
        std::io::copy(&mut script, &mut tmp)?;
        tmp.write_all(epilogue_text(&fds).as_bytes())?;
        tmp.seek(SeekFrom::Start(0))?;
        // Installing the scratch file as stdin is what makes the loop
        // execute the script.
        redirect::dup2(fds.script, libc::STDIN_FILENO)?;
        Ok(())
    })();

    if let Err(e) = build {
        teardown(&fds);
        return Err(e).with_context(|| format!("running script '{}'", path));
    }

    // The scratch descriptor stays open until the epilogue closes it.
    into_table(tmp);
    log::info!("sourcing '{}' via scratch stdin", path);
    Ok(0)
}
