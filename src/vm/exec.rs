//! The executor: run a loaded image to completion and reclaim it.
//!
//! Control is transferred to the image's first byte with the contract that
//! the child never returns normally; it always completes through the exit
//! path, which deposits an integer status in the continuation established
//! before the transfer. The interpreter below replaces the platform's
//! literal co-resident execution: it operates on the owned image buffer with
//! bounds-checked loads and stores, so an errant child faults instead of
//! corrupting its spawner, while the ABI and the budget/ownership contracts
//! are unchanged. Once the continuation is completed, the executor reads the
//! status slot, frees the image, and hands the status to its caller.

use crate::vm::VmError;
use crate::vm::image::Image;
use crate::vm::opcode::Opcode;
use std::cell::Cell;

/// The saved resumption point a child's exit path transfers control back to.
///
/// The child deposits its status here exactly once; its spawner never polls.
#[derive(Debug, Default)]
pub struct Continuation {
    status: Cell<Option<i64>>,
}

impl Continuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit the exit status. The first completion wins; a second one is
    /// ignored, preserving the resumed-exactly-once contract.
    pub fn complete(&self, status: i64) {
        if self.status.get().is_none() {
            self.status.set(Some(status));
        }
    }

    /// The deposited status, if the child has completed.
    pub fn status(&self) -> Option<i64> {
        self.status.get()
    }

    /// Address a child's startup code uses to find its way back here.
    pub fn resume_token(&self) -> usize {
        self as *const Continuation as usize
    }

    /// Address of the status slot the exit path writes.
    pub fn status_token(&self) -> usize {
        &self.status as *const Cell<Option<i64>> as usize
    }
}

/// Host I/O surface exposed to a running child.
pub trait VmIo {
    /// Read one byte of input; `None` at end of input.
    fn read_byte(&mut self) -> std::io::Result<Option<u8>>;
    /// Write one raw byte of output.
    fn write_byte(&mut self, byte: u8) -> std::io::Result<()>;
    /// Write one character of output.
    fn write_char(&mut self, value: u64) -> std::io::Result<()>;
}

/// The live standard streams, read and written at the descriptor level so
/// that statement redirections apply to spawned children too.
#[derive(Debug, Default)]
pub struct HostStreams;

impl VmIo for HostStreams {
    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(libc::STDIN_FILENO, byte.as_mut_ptr().cast(), 1) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((n > 0).then_some(byte[0]))
    }

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        use std::io::Write;
        let mut out = std::io::stdout();
        out.write_all(&[byte])?;
        out.flush()
    }

    fn write_char(&mut self, value: u64) -> std::io::Result<()> {
        use std::io::Write;
        let ch = char::from_u32(value as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
        let mut out = std::io::stdout();
        write!(out, "{}", ch)?;
        out.flush()
    }
}

/// Run a loaded image to completion.
///
/// Consumes the image: whether the child exits cleanly or faults, the buffer
/// is reclaimed before this returns.
pub fn run(mut image: Image, continuation: &Continuation, io: &mut dyn VmIo) -> Result<i64, VmError> {
    let outcome = {
        let mem = image.mem_mut();
        let sp = mem.len() as u64;
        let mut machine = Machine { mem, pc: 0, sp, io };
        machine.run()
    };
    drop(image);

    let status = outcome?;
    continuation.complete(status);
    Ok(continuation.status().unwrap_or(0))
}

/// The embedded stack machine. Cells are 64-bit; the stack grows downward
/// from the top of the image, and code, data and stack share the one buffer
/// just as they do on the real platform, and only the buffer's bounds are
/// enforced.
struct Machine<'m, 'io> {
    mem: &'m mut [u8],
    pc: usize,
    sp: u64,
    io: &'io mut dyn VmIo,
}

impl Machine<'_, '_> {
    fn run(&mut self) -> Result<i64, VmError> {
        loop {
            if let Some(status) = self.step()? {
                return Ok(status);
            }
        }
    }

    /// Execute one instruction; `Some(status)` when the exit path ran.
    fn step(&mut self) -> Result<Option<i64>, VmError> {
        let at = self.pc;
        if at >= self.mem.len() {
            return Err(VmError::MemoryFault {
                address: at as u64,
                len: 1,
                size: self.mem.len(),
            });
        }
        let byte = self.mem[at];
        let Some(op) = Opcode::from_byte(byte) else {
            return Err(VmError::IllegalOpcode { byte, pc: at });
        };
        self.pc = at + 1;

        match op {
            Opcode::Exit => {
                // Status is the top of stack; a bare exit reports zero.
                let status = if self.stack_empty() { 0 } else { self.pop()? };
                return Ok(Some(status as i64));
            }
            Opcode::Nop => {}
            Opcode::Jump => {
                let target = self.pop()?;
                self.pc = usize::try_from(target).map_err(|_| VmError::MemoryFault {
                    address: target,
                    len: 1,
                    size: self.mem.len(),
                })?;
            }
            Opcode::JzFwd => {
                let offset = self.pop()?;
                let cond = self.pop()?;
                if cond == 0 {
                    self.pc = self.pc.wrapping_add(offset as usize);
                }
            }
            Opcode::JzBack => {
                let offset = self.pop()?;
                let cond = self.pop()?;
                if cond == 0 {
                    self.pc = self.pc.wrapping_sub(offset as usize);
                }
            }
            Opcode::SetSp => {
                let v = self.pop()?;
                if v > self.mem.len() as u64 {
                    return Err(VmError::StackFault { sp: v });
                }
                self.sp = v;
            }
            Opcode::GetPc => {
                let pc = self.pc as u64;
                self.push(pc)?;
            }
            Opcode::GetSp => {
                let sp = self.sp;
                self.push(sp)?;
            }
            Opcode::Push0 => self.push(0)?,
            Opcode::Push1 | Opcode::Push2 | Opcode::Push4 | Opcode::Push8 => {
                let width = op.operand_len();
                let v = self.read_mem(self.pc as u64, width)?;
                self.pc += width;
                self.push(v)?;
            }
            Opcode::Load1 | Opcode::Load2 | Opcode::Load4 | Opcode::Load8 => {
                let width = 1 << (byte - Opcode::Load1 as u8);
                let addr = self.pop()?;
                let v = self.read_mem(addr, width)?;
                self.push(v)?;
            }
            Opcode::Store1 | Opcode::Store2 | Opcode::Store4 | Opcode::Store8 => {
                let width = 1 << (byte - Opcode::Store1 as u8);
                let addr = self.pop()?;
                let v = self.pop()?;
                self.write_mem(addr, width, v)?;
            }
            Opcode::Add => self.binary(|b, a| b.wrapping_add(a))?,
            Opcode::Mult => self.binary(|b, a| b.wrapping_mul(a))?,
            Opcode::Div => {
                let a = self.pop()?;
                let b = self.pop()?;
                if a == 0 {
                    return Err(VmError::DivideByZero { pc: at });
                }
                self.push(b / a)?;
            }
            Opcode::Rem => {
                let a = self.pop()?;
                let b = self.pop()?;
                if a == 0 {
                    return Err(VmError::DivideByZero { pc: at });
                }
                self.push(b % a)?;
            }
            Opcode::Lt => self.binary(|b, a| (b < a) as u64)?,
            Opcode::And => self.binary(|b, a| b & a)?,
            Opcode::Or => self.binary(|b, a| b | a)?,
            Opcode::Not => {
                let v = self.pop()?;
                self.push(!v)?;
            }
            Opcode::Xor => self.binary(|b, a| b ^ a)?,
            Opcode::Pow => {
                let x = self.pop()?;
                let v = if x < 64 { 1u64 << x } else { 0 };
                self.push(v)?;
            }
            Opcode::Check => {
                // Version checkpoint: statically it ends the first basic
                // block; at run time it has nothing to verify on this host.
            }
            Opcode::ReadChar => {
                let v = match self.io.read_byte()? {
                    Some(b) => b as u64,
                    None => u64::MAX,
                };
                self.push(v)?;
            }
            Opcode::PutByte => {
                let v = self.pop()?;
                self.io.write_byte(v as u8)?;
            }
            Opcode::PutChar => {
                let v = self.pop()?;
                self.io.write_char(v)?;
            }
            Opcode::AddSample => {
                self.pop()?;
            }
            Opcode::SetPixel => {
                self.pop()?;
                self.pop()?;
                self.pop()?;
            }
            Opcode::NewFrame => {}
            Opcode::ReadPixel => {
                self.pop()?;
                self.pop()?;
                self.push(0)?;
            }
            Opcode::ReadFrame => self.push(0)?,
        }
        Ok(None)
    }

    fn stack_empty(&self) -> bool {
        self.sp >= self.mem.len() as u64
    }

    fn push(&mut self, v: u64) -> Result<(), VmError> {
        if self.sp < 8 {
            return Err(VmError::StackFault { sp: self.sp });
        }
        self.sp -= 8;
        let sp = self.sp;
        self.write_mem(sp, 8, v)
    }

    fn pop(&mut self) -> Result<u64, VmError> {
        if self.sp + 8 > self.mem.len() as u64 {
            return Err(VmError::StackFault { sp: self.sp });
        }
        let v = self.read_mem(self.sp, 8)?;
        self.sp += 8;
        Ok(v)
    }

    fn binary(&mut self, f: impl FnOnce(u64, u64) -> u64) -> Result<(), VmError> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.push(f(b, a))
    }

    fn read_mem(&self, addr: u64, width: usize) -> Result<u64, VmError> {
        let range = self.check(addr, width)?;
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.mem[range]);
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_mem(&mut self, addr: u64, width: usize, v: u64) -> Result<(), VmError> {
        let range = self.check(addr, width)?;
        self.mem[range].copy_from_slice(&v.to_le_bytes()[..width]);
        Ok(())
    }

    fn check(&self, addr: u64, width: usize) -> Result<std::ops::Range<usize>, VmError> {
        let start = usize::try_from(addr).ok();
        match start {
            Some(start) if start.checked_add(width).is_some_and(|end| end <= self.mem.len()) => {
                Ok(start..start + width)
            }
            _ => Err(VmError::MemoryFault {
                address: addr,
                len: width,
                size: self.mem.len(),
            }),
        }
    }
}
