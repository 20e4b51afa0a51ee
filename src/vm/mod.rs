//! The spawn subsystem: validate, partition, load, execute, reclaim.
//!
//! A spawn turns a file into a running child program. There is no process
//! isolation on this platform: the child is an opcode stream executed by an
//! embedded interpreter over a memory image the spawner owns, with a budget
//! carved out of empirically probed free memory. The full sequence is
//! reentrant: a running child may spawn again, each level operating on its
//! own, smaller region.

pub mod exec;
pub mod image;
pub mod opcode;
pub mod partition;
pub mod validate;

use crate::session::Session;
use exec::{Continuation, VmIo};
use image::Image;
use partition::{AllocProbe, HeapProbe, Partitioner, ProbeParams};
use std::os::unix::fs::PermissionsExt;
use thiserror::Error;
use validate::{ScanMode, Thresholds};

/// Errors of the spawn pipeline and the embedded machine.
#[derive(Debug, Error)]
pub enum VmError {
    /// The candidate file exists but lacks execute permission.
    #[error("permission denied: '{0}'")]
    NotExecutable(String),
    /// The candidate file could not be found or statted.
    #[error("command not found: '{0}'")]
    NotFound(String),
    /// The memory probe found no free space at all.
    #[error("no free memory to spawn into")]
    OutOfMemory,
    /// The candidate file does not fit in the allotted budget.
    #[error("not enough memory to load binary ({budget} byte budget, {file_size} byte file)")]
    BudgetExceeded { budget: u64, file_size: u64 },
    /// The validator rejected the file's opening basic block.
    #[error("binary format error: '{0}'")]
    BadFormat(String),
    /// The image's blocks do not fit in the allotted budget.
    #[error("image layout exceeds the {budget} byte budget")]
    ImageOverflow { budget: u64 },
    /// The running child touched memory outside its image.
    #[error("memory fault: address {address:#x} (+{len}) outside {size} byte image")]
    MemoryFault { address: u64, len: usize, size: usize },
    /// The running child's stack left the image.
    #[error("stack fault at {sp:#x}")]
    StackFault { sp: u64 },
    /// The running child executed a reserved opcode byte.
    #[error("illegal opcode {byte:#04x} at {pc:#x}")]
    IllegalOpcode { byte: u8, pc: usize },
    /// Division or remainder by zero.
    #[error("division by zero at {pc:#x}")]
    DivideByZero { pc: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Budget policy plus probe parameters for one spawn invocation.
#[derive(Debug, Clone, Copy)]
pub struct SpawnContext {
    partitioner: Partitioner,
    params: ProbeParams,
}

impl SpawnContext {
    /// Context for a spawn issued by the resident shell: the measured free
    /// memory is fractioned once to keep headroom for shell services.
    pub fn root() -> Self {
        Self {
            partitioner: Partitioner::root(),
            params: ProbeParams::for_spawn(),
        }
    }

    /// Context for a spawn issued from inside a lent region: the probe is
    /// clamped to the lease and not fractioned again.
    pub fn nested(limit: u64) -> Self {
        Self {
            partitioner: Partitioner::nested(limit),
            params: ProbeParams::for_spawn(),
        }
    }
}

/// Spawn `path` with `args`, probing the real heap for the budget.
///
/// Returns the child's exit status. Blocks until the child completes; the
/// dispatch loop does not advance past a spawn.
pub fn spawn(
    path: &str,
    args: &[String],
    session: &mut Session,
    ctx: &SpawnContext,
    io: &mut dyn VmIo,
) -> Result<i32, VmError> {
    spawn_with(path, args, session, ctx, &mut HeapProbe, io)
}

/// [`spawn`] with an explicit allocation probe, so budgets can be pinned
/// down in tests.
pub fn spawn_with(
    path: &str,
    args: &[String],
    session: &mut Session,
    ctx: &SpawnContext,
    probe: &mut dyn AllocProbe,
    io: &mut dyn VmIo,
) -> Result<i32, VmError> {
    // The execute bit is the only gate before the file is ever opened.
    let meta = std::fs::metadata(path).map_err(|_| VmError::NotFound(path.to_string()))?;
    if meta.permissions().mode() & 0o100 == 0 {
        return Err(VmError::NotExecutable(path.to_string()));
    }
    let file_size = meta.len();

    let budget = ctx.partitioner.budget(probe, &ctx.params);
    if budget == 0 {
        return Err(VmError::OutOfMemory);
    }
    if file_size > budget {
        return Err(VmError::BudgetExceeded { budget, file_size });
    }

    let mut file = std::fs::File::open(path)?;
    let verdict = validate::validate(&mut file, ScanMode::Exhaustive, &Thresholds::default())?;
    if !verdict.valid {
        return Err(VmError::BadFormat(path.to_string()));
    }

    // Child argv: the program name followed by its arguments.
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(path.to_string());
    argv.extend(args.iter().cloned());

    let continuation = Continuation::new();
    let image = Image::load(&mut file, file_size, budget, &argv, session, &continuation)?;
    log::info!(
        "spawning '{}' ({} byte file, {} byte budget)",
        path,
        file_size,
        budget
    );

    let status = exec::run(image, &continuation, io)?;
    log::info!("'{}' returned {}", path, status);
    Ok(status as i32)
}
