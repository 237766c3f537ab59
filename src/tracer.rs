//! Execution traces and memory-access logs written to disk

use crate::instruction::{Instruction, Opcode, Operand};
use crate::interface::RegisterState;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

fn create(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path)?;
    Ok(BufWriter::new(file))
}

/// One line per executed instruction, with the operand values it saw
pub struct Tracer<W: Write = BufWriter<File>> {
    out: W,
}

impl Tracer {
    pub fn create(path: impl AsRef<Path>, start: u16) -> io::Result<Self> {
        debug!("Tracing to {}", path.as_ref().display());
        Tracer::new(create(path.as_ref())?, start)
    }
}

impl<W: Write> Tracer<W> {
    pub fn new(mut out: W, start: u16) -> io::Result<Self> {
        writeln!(out, "Starting trace from address {start:04x}")?;
        Ok(Self { out })
    }

    /// Record `inst`, executed with `registers` as they were before it ran
    pub fn record(&mut self, inst: &Instruction, registers: &RegisterState) -> io::Result<()> {
        let mut line = format!("{:04x}:{}", inst.address, inst);
        for _ in inst.operands.len()..4 {
            line.push_str("    ");
        }
        line.push('\t');
        for operand in &inst.operands {
            match operand {
                Operand::Literal(x) => line.push_str(&format!("<{x:04x}>  ")),
                Operand::Register(r) => {
                    line.push_str(&format!("R{r}:{:04x} ", registers.registers[*r as usize]))
                }
                Operand::Invalid(e) => line.push_str(&format!("? {e:04x} ?")),
            }
        }
        writeln!(self.out, "{}", line.trim_end())
    }
}

impl<W: Write> Drop for Tracer<W> {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

/// Records jumps, loads, stores, calls and returns as `T pppp aaaa`
pub struct AccessTracker<W: Write = BufWriter<File>> {
    destination: W,
}

impl AccessTracker {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(AccessTracker::new(create(path.as_ref())?))
    }
}

impl<W: Write> AccessTracker<W> {
    pub fn new(destination: W) -> Self {
        Self { destination }
    }

    /// Log `inst` if it transfers control or touches memory.
    /// Returns whether a line was written.
    pub fn instruction(&mut self, inst: &Instruction, registers: &RegisterState) -> io::Result<bool> {
        let (kind, target) = match inst.opcode {
            Opcode::Jmp => ('J', inst.operands[0]),
            // Literal conditions that can never jump are skipped
            Opcode::Jt => match inst.operands[0] {
                Operand::Literal(0) => return Ok(false),
                _ => ('S', inst.operands[1]),
            },
            Opcode::Jf => match inst.operands[0] {
                Operand::Literal(v) if v != 0 => return Ok(false),
                _ => ('S', inst.operands[1]),
            },
            Opcode::Rmem => ('L', inst.operands[1]),
            Opcode::Wmem => ('W', inst.operands[0]),
            Opcode::Call => ('C', inst.operands[0]),
            // The return address is on the stack, not in the instruction
            Opcode::Ret => ('R', Operand::Literal(0x7fff)),
            _ => return Ok(false),
        };

        let address = match target {
            Operand::Literal(x) | Operand::Invalid(x) => x,
            Operand::Register(r) => registers.registers[r as usize],
        };
        writeln!(self.destination, "{kind} {:04x} {address:04x}", inst.address)?;
        Ok(true)
    }
}

impl<W: Write> Drop for AccessTracker<W> {
    fn drop(&mut self) {
        let _ = self.destination.flush();
    }
}
