//! The VM memory image and its loader.
//!
//! A spawned program lives in a single zero-initialized contiguous buffer,
//! owned exclusively by one spawn invocation and laid out as:
//!
//! ```text
//! +--------------------------------------+-------+-------+-----+----------+
//! | binary bytes (offset 0)                                               |
//! +--------------------------------------+-------+-------+-----+----------+
//! | N = no. of bytes of arguments (8 LE) | byte0 | byte1 | ... | byte N-1 |
//! +--------------------------------------+-------+-------+-----+----------+
//! | M = no. of bytes of environ.  (8 LE) | byte0 | byte1 | ... | byte M-1 |
//! +--------------------------------------+-------+-------+-----+----------+
//! ```
//!
//! Arguments and environment entries are NUL-terminated strings concatenated
//! with no added separators beyond the embedded NULs. The buffer is at least
//! as large as the candidate file and is freed when the spawn completes.

use crate::session::Session;
use crate::vm::VmError;
use crate::vm::exec::Continuation;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// Names of the transient variables a child's startup code discovers. They
/// are injected into the session environment only while the environment
/// block is serialized and removed immediately afterwards, so they never
/// leak past one spawn call and never appear in the child's own view.
pub const RESUME_VAR: &str = "VMSH_SPAWN_RESUME_AT";
pub const STATUS_VAR: &str = "VMSH_SPAWN_STATUS_AT";
pub const MEMORY_TOP_VAR: &str = "VMSH_SPAWN_MEMORY_TOP";

/// One spawn invocation's memory image.
#[derive(Debug)]
pub struct Image {
    mem: Vec<u8>,
    code_len: usize,
    arg_block_at: usize,
    env_block_at: usize,
}

impl Image {
    /// Build the image: copy the candidate's bytes to offset 0, then write
    /// the argument and environment blocks.
    pub fn load(
        file: &mut File,
        file_size: u64,
        budget: u64,
        argv: &[String],
        session: &mut Session,
        continuation: &Continuation,
    ) -> Result<Image, VmError> {
        let budget_usize =
            usize::try_from(budget).map_err(|_| VmError::ImageOverflow { budget })?;
        let code_len =
            usize::try_from(file_size).map_err(|_| VmError::ImageOverflow { budget })?;
        if code_len > budget_usize {
            return Err(VmError::BudgetExceeded { budget, file_size });
        }

        let mut mem = vec![0u8; budget_usize];

        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut mem[..code_len])?;

        let arg_block_at = code_len;
        let arg_bytes = packed_strings(argv);

        // The three discovery variables exist only for the duration of the
        // environment serialization below.
        session.set_var(RESUME_VAR, format!("{:#x}", continuation.resume_token()));
        session.set_var(STATUS_VAR, format!("{:#x}", continuation.status_token()));
        session.set_var(
            MEMORY_TOP_VAR,
            format!("{:#x}", mem.as_ptr() as usize + budget_usize - 1),
        );
        let environ = session.environ();
        session.unset_var(RESUME_VAR);
        session.unset_var(STATUS_VAR);
        session.unset_var(MEMORY_TOP_VAR);

        let env_bytes = packed_strings(&environ);

        let needed = code_len + 8 + arg_bytes.len() + 8 + env_bytes.len();
        if needed > budget_usize {
            return Err(VmError::ImageOverflow { budget });
        }

        let mut at = arg_block_at;
        mem[at..at + 8].copy_from_slice(&(arg_bytes.len() as u64).to_le_bytes());
        at += 8;
        mem[at..at + arg_bytes.len()].copy_from_slice(&arg_bytes);
        at += arg_bytes.len();
        let env_block_at = at;
        mem[at..at + 8].copy_from_slice(&(env_bytes.len() as u64).to_le_bytes());
        at += 8;
        mem[at..at + env_bytes.len()].copy_from_slice(&env_bytes);

        Ok(Image { mem, code_len, arg_block_at, env_block_at })
    }

    /// Total image size in bytes (the full budget).
    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Length of the program text at offset 0.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// The NUL-separated argument strings.
    pub fn arg_strings(&self) -> Vec<String> {
        self.unpack_block(self.arg_block_at)
    }

    /// The NUL-separated `KEY=value` environment strings.
    pub fn env_strings(&self) -> Vec<String> {
        self.unpack_block(self.env_block_at)
    }

    pub(crate) fn mem_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    #[cfg(test)]
    pub(crate) fn mem(&self) -> &[u8] {
        &self.mem
    }

    fn unpack_block(&self, at: usize) -> Vec<String> {
        let len = u64::from_le_bytes(self.mem[at..at + 8].try_into().unwrap()) as usize;
        let bytes = &self.mem[at + 8..at + 8 + len];
        bytes
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }
}

/// Concatenate strings as NUL-terminated bytes.
fn packed_strings(strings: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for s in strings {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn program_file(bytes: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    fn small_session() -> Session {
        let mut session = Session::new();
        session.vars.clear();
        session.set_var("HOME", "/here");
        session
    }

    #[test]
    fn test_layout_binary_then_args_then_env() {
        let code = [0x06u8, 0x06, 0x09, 0x10, 0x09, 0x20, 0x20, 0x20];
        let mut f = program_file(&code);
        let mut session = small_session();
        let continuation = Continuation::new();
        let argv = vec!["prog".to_string(), "a b".to_string()];

        let image =
            Image::load(&mut f, code.len() as u64, 4096, &argv, &mut session, &continuation)
                .unwrap();

        assert_eq!(image.size(), 4096);
        assert_eq!(&image.mem()[..code.len()], &code);

        // Argument block: 8-byte little-endian length, then "prog\0a b\0".
        let at = code.len();
        let arg_len = u64::from_le_bytes(image.mem()[at..at + 8].try_into().unwrap());
        assert_eq!(arg_len, 9);
        assert_eq!(&image.mem()[at + 8..at + 8 + 9], b"prog\0a b\0");

        assert_eq!(image.arg_strings(), argv);
        assert!(image.env_strings().contains(&"HOME=/here".to_string()));
    }

    #[test]
    fn test_zero_fill_beyond_blocks() {
        let code = [0x01u8; 4];
        let mut f = program_file(&code);
        let mut session = small_session();
        let continuation = Continuation::new();

        let image =
            Image::load(&mut f, 4, 1024, &[], &mut session, &continuation).unwrap();
        // Everything past the last block is zero-initialized.
        assert!(image.mem()[image.size() - 64..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_discovery_vars_in_block_but_not_in_session() {
        let code = [0x01u8; 4];
        let mut f = program_file(&code);
        let mut session = small_session();
        let continuation = Continuation::new();

        let image =
            Image::load(&mut f, 4, 4096, &[], &mut session, &continuation).unwrap();

        let env = image.env_strings();
        assert!(env.iter().any(|e| e.starts_with("VMSH_SPAWN_RESUME_AT=0x")));
        assert!(env.iter().any(|e| e.starts_with("VMSH_SPAWN_STATUS_AT=0x")));
        assert!(env.iter().any(|e| e.starts_with("VMSH_SPAWN_MEMORY_TOP=0x")));

        // Never left behind in the session.
        assert_eq!(session.get_var(RESUME_VAR), None);
        assert_eq!(session.get_var(STATUS_VAR), None);
        assert_eq!(session.get_var(MEMORY_TOP_VAR), None);
    }

    #[test]
    fn test_blocks_must_fit_in_budget() {
        let code = [0x01u8; 16];
        let mut f = program_file(&code);
        let mut session = small_session();
        let continuation = Continuation::new();

        // Budget covers the code but not the argument/environment blocks.
        let err = Image::load(&mut f, 16, 20, &["x".to_string()], &mut session, &continuation)
            .unwrap_err();
        assert!(matches!(err, VmError::ImageOverflow { budget: 20 }));
    }
}
