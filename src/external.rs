use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::session::Session;
use crate::vm::exec::HostStreams;
use crate::vm::{self, SpawnContext};
use anyhow::Result;
use std::ffi::CString;
use std::io::{Read, Write};

/// Command that is not a builtin: a file with execute permission, run as an
/// implicit spawn with the remaining tokens as its arguments.
pub struct ExternalCommand {
    path: String,
    args: Vec<String>,
}

impl CommandFactory for Factory {
    fn try_create(
        &self,
        _session: &Session,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        if !has_execute_permission(name) {
            return None;
        }
        Some(Box::new(ExternalCommand {
            path: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }))
    }
}

/// Factory of last resort: claims any name that resolves to an executable
/// file. Registered after every builtin factory.
#[derive(Default)]
pub struct Factory;

impl ExecutableCommand for ExternalCommand {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Read,
        _stdout: &mut dyn Write,
        session: &mut Session,
    ) -> Result<ExitCode> {
        let mut io = HostStreams;
        match vm::spawn(&self.path, &self.args, session, &SpawnContext::root(), &mut io) {
            Ok(status) => Ok(status),
            Err(e) => {
                eprintln!("spawn: {}", e);
                Ok(-1)
            }
        }
    }
}

/// The execute bit is the only thing consulted here; everything else about
/// the candidate is judged by the spawn pipeline.
fn has_execute_permission(path: &str) -> bool {
    let Ok(cpath) = CString::new(path) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_claims_only_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        let exec = dir.path().join("exec");
        fs::write(&plain, b"x").unwrap();
        fs::write(&exec, b"x").unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();

        let session = Session::new();
        let factory = Factory;
        assert!(
            factory
                .try_create(&session, &exec.to_string_lossy(), &[])
                .is_some()
        );
        assert!(
            factory
                .try_create(&session, &plain.to_string_lossy(), &[])
                .is_none()
        );
        assert!(factory.try_create(&session, "no-such-file-here", &[]).is_none());
    }
}
