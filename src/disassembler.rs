use crate::instruction::Instruction;
use std::fmt::Write as _;
use std::io::{self, Write};

/// Longest string [`Disassembler::strings`] will report
const MAX_STRING_LEN: usize = 256;

pub struct Disassembler<'a> {
    memory: &'a [u16],
}

fn printable(byte: u8) -> Option<char> {
    if byte.is_ascii_graphic() || byte == b' ' {
        Some(byte as char)
    } else {
        None
    }
}

/// Eight columns of ASCII, one per word, `.` for anything unprintable
fn ascii_preview(words: &[u16]) -> String {
    let mut preview: String = words
        .iter()
        .take(8)
        .map(|w| match *w {
            w if w < 0x80 => printable(w as u8).unwrap_or('.'),
            _ => '.',
        })
        .collect();
    while preview.len() < 8 {
        preview.push(' ');
    }
    preview
}

impl<'a> Disassembler<'a> {
    pub fn new(memory: &'a [u16]) -> Self {
        Disassembler { memory }
    }

    fn format_instruction(&self, inst: &Instruction) -> String {
        format!("{:04x}: {}", inst.address, inst)
    }

    fn format_data(&self, address: usize) -> String {
        format!("{:04x}: DATA {:04x}", address, self.memory[address])
    }

    /// Disassemble `count` rows starting at `start`.
    ///
    /// Words that do not decode are shown as data and skipped one at a time.
    pub fn disassemble(&self, start: usize, count: usize) -> Vec<String> {
        let mut lines = Vec::with_capacity(count);
        let mut pc = start;
        while lines.len() < count && pc < self.memory.len() {
            match Instruction::decode(self.memory, pc) {
                Ok(inst) => {
                    lines.push(self.format_instruction(&inst));
                    pc += inst.len();
                }
                Err(_) => {
                    lines.push(self.format_data(pc));
                    pc += 1;
                }
            }
        }
        lines
    }

    /// Write a listing of all of memory.
    ///
    /// Instruction rows carry an ASCII preview of their words. Data rows
    /// show the raw word and whichever of its bytes are printable.
    pub fn write_listing(&self, out: &mut impl Write) -> io::Result<()> {
        let mut pc = 0;
        while pc < self.memory.len() {
            match Instruction::decode(self.memory, pc) {
                Ok(inst) => {
                    let end = pc + inst.len();
                    writeln!(
                        out,
                        "{:<32}| {}",
                        self.format_instruction(&inst),
                        ascii_preview(&self.memory[pc..end])
                    )?;
                    pc = end;
                }
                Err(_) => {
                    let [low, high] = self.memory[pc].to_le_bytes();
                    let mut line = format!("{:<32}|", self.format_data(pc));
                    if let Some(c) = printable(low) {
                        let _ = write!(line, " lo '{c}'");
                    }
                    if let Some(c) = printable(high) {
                        let _ = write!(line, " hi '{c}'");
                    }
                    writeln!(out, "{}", line.trim_end())?;
                    pc += 1;
                }
            }
        }
        out.flush()
    }

    /// Find plausible length-prefixed ASCII strings at least `min_len` long
    pub fn strings(&self, min_len: usize) -> Vec<(u16, String)> {
        let mut found = Vec::new();
        let mut address = 0;
        while address < self.memory.len() {
            let length = self.memory[address] as usize;
            let end = address + 1 + length;
            if length >= min_len.max(1) && length <= MAX_STRING_LEN && end <= self.memory.len() {
                let body = &self.memory[address + 1..end];
                if body
                    .iter()
                    .all(|w| *w == '\n' as u16 || (*w < 0x80 && printable(*w as u8).is_some()))
                {
                    let text = body.iter().map(|w| *w as u8 as char).collect();
                    found.push((address as u16, text));
                    address = end;
                    continue;
                }
            }
            address += 1;
        }
        found
    }
}
