//! Machine state snapshots in an IFF container
//!
//! Layout: `FORM`, total size, form type `SVMS`, then chunks. Each chunk is a
//! 4-byte type, a big-endian size and its data, padded to an even length.
//!
//! * `REGS` - the eight registers followed by the program counter
//! * `STAK` - stack words, bottom first
//! * `MEMR` - all memory words
//! * `INPT` - input characters that have not been read yet
//!
//! All words are big-endian. `REGS` and `MEMR` are required.

use crate::instruction::REGISTER_COUNT;
use crate::vm::{VirtualMachine, MEMORY_SIZE};
use log::debug;
use std::fs;
use std::path::Path;

const FORM_TYPE: [u8; 4] = *b"SVMS";

/// IFF file structure
pub struct IffFile {
    pub form_type: [u8; 4],
    pub chunks: Vec<IffChunk>,
}

/// Individual chunk in an IFF file
pub struct IffChunk {
    pub chunk_type: [u8; 4],
    pub data: Vec<u8>,
}

impl Default for IffFile {
    fn default() -> Self {
        Self::new()
    }
}

impl IffFile {
    pub fn new() -> Self {
        IffFile {
            form_type: FORM_TYPE,
            chunks: Vec::new(),
        }
    }

    pub fn add_chunk(&mut self, chunk_type: [u8; 4], data: Vec<u8>) {
        self.chunks.push(IffChunk { chunk_type, data });
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Form type plus each chunk header, data and padding
        let total_size = 4 + self
            .chunks
            .iter()
            .map(|c| 8 + c.data.len() + c.data.len() % 2)
            .sum::<usize>();

        let mut out = Vec::with_capacity(total_size + 8);
        out.extend_from_slice(b"FORM");
        out.extend_from_slice(&(total_size as u32).to_be_bytes());
        out.extend_from_slice(&self.form_type);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.chunk_type);
            out.extend_from_slice(&(chunk.data.len() as u32).to_be_bytes());
            out.extend_from_slice(&chunk.data);
            if chunk.data.len() % 2 == 1 {
                out.push(0);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < 12 {
            return Err("File too short for an IFF header".to_string());
        }
        if &bytes[0..4] != b"FORM" {
            return Err("Not an IFF file (missing FORM header)".to_string());
        }
        let mut form_type = [0u8; 4];
        form_type.copy_from_slice(&bytes[8..12]);

        let mut iff = IffFile {
            form_type,
            chunks: Vec::new(),
        };

        let mut pos = 12;
        while pos + 8 <= bytes.len() {
            let mut chunk_type = [0u8; 4];
            chunk_type.copy_from_slice(&bytes[pos..pos + 4]);
            let mut size_bytes = [0u8; 4];
            size_bytes.copy_from_slice(&bytes[pos + 4..pos + 8]);
            let chunk_size = u32::from_be_bytes(size_bytes) as usize;

            let start = pos + 8;
            let end = start + chunk_size;
            if end > bytes.len() {
                return Err(format!(
                    "Chunk {} is truncated",
                    String::from_utf8_lossy(&chunk_type)
                ));
            }
            iff.chunks.push(IffChunk {
                chunk_type,
                data: bytes[start..end].to_vec(),
            });
            // Skip padding byte if chunk size is odd
            pos = end + chunk_size % 2;
        }

        Ok(iff)
    }

    pub fn find_chunk(&self, chunk_type: &[u8; 4]) -> Option<&IffChunk> {
        self.chunks.iter().find(|c| &c.chunk_type == chunk_type)
    }
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialise the machine state
pub fn to_bytes(vm: &VirtualMachine) -> Vec<u8> {
    let mut iff = IffFile::new();

    let mut regs = vm.registers.to_vec();
    regs.push(vm.pc);
    iff.add_chunk(*b"REGS", words_to_bytes(&regs));
    iff.add_chunk(*b"STAK", words_to_bytes(&vm.stack));
    iff.add_chunk(*b"MEMR", words_to_bytes(&vm.memory));

    if !vm.input.is_empty() {
        let pending: Vec<u16> = vm.input.iter().copied().collect();
        iff.add_chunk(*b"INPT", words_to_bytes(&pending));
    }

    iff.to_bytes()
}

/// Rebuild a machine from [`to_bytes`] output
pub fn from_bytes(bytes: &[u8]) -> Result<VirtualMachine, String> {
    let iff = IffFile::from_bytes(bytes)?;
    if iff.form_type != FORM_TYPE {
        return Err(format!(
            "Not a machine snapshot (form type {})",
            String::from_utf8_lossy(&iff.form_type)
        ));
    }

    let regs = iff
        .find_chunk(b"REGS")
        .ok_or("Snapshot has no REGS chunk")?;
    let regs = bytes_to_words(&regs.data);
    if regs.len() != REGISTER_COUNT + 1 {
        return Err(format!("REGS chunk holds {} words, expected 9", regs.len()));
    }

    let memory = iff
        .find_chunk(b"MEMR")
        .ok_or("Snapshot has no MEMR chunk")?;
    let memory = bytes_to_words(&memory.data);
    if memory.len() > MEMORY_SIZE {
        return Err(format!("MEMR chunk holds {} words", memory.len()));
    }

    let mut vm = VirtualMachine::from_words(&memory)?;
    vm.registers.copy_from_slice(&regs[..REGISTER_COUNT]);
    vm.set_pc(regs[REGISTER_COUNT]);

    if let Some(stack) = iff.find_chunk(b"STAK") {
        vm.stack = bytes_to_words(&stack.data);
    }
    if let Some(input) = iff.find_chunk(b"INPT") {
        vm.input = bytes_to_words(&input.data).into_iter().collect();
    }

    debug!(
        "Restored snapshot: PC {:04x}, {} stack words",
        vm.pc,
        vm.stack.len()
    );
    Ok(vm)
}

pub fn save_state(vm: &VirtualMachine, path: impl AsRef<Path>) -> Result<(), String> {
    let path = path.as_ref();
    fs::write(path, to_bytes(vm))
        .map_err(|e| format!("Failed to write state to '{}': {}", path.display(), e))?;
    debug!("Saved state to {}", path.display());
    Ok(())
}

pub fn load_state(path: impl AsRef<Path>) -> Result<VirtualMachine, String> {
    let path = path.as_ref();
    let bytes =
        fs::read(path).map_err(|e| format!("Failed to open state '{}': {}", path.display(), e))?;
    from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_chunk_padding() {
        let mut iff = IffFile::new();
        iff.add_chunk(*b"ABCD", vec![1, 2, 3]);
        iff.add_chunk(*b"EFGH", vec![4, 5]);
        let bytes = iff.to_bytes();

        assert_eq!(&bytes[0..4], b"FORM");
        // form type + (8 + 3 + 1) + (8 + 2)
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 26);
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[23], 0);

        let parsed = IffFile::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.chunks.len(), 2);
        assert_eq!(parsed.find_chunk(b"ABCD").unwrap().data, vec![1, 2, 3]);
        assert_eq!(parsed.find_chunk(b"EFGH").unwrap().data, vec![4, 5]);
        assert!(parsed.find_chunk(b"XXXX").is_none());
    }

    #[test]
    fn test_snapshot_restores_machine() {
        let mut vm = VirtualMachine::from_words(&[20, 32768, 19, 32768, 0]).unwrap();
        vm.set_register(3, 0x1234).unwrap();
        vm.stack.push(7);
        vm.stack.push(0x7fff);
        vm.write(0x7fff, 42);
        vm.set_pc(2);
        vm.push_input("go\n");

        let restored = from_bytes(&to_bytes(&vm)).unwrap();
        assert_eq!(restored.registers(), vm.registers());
        assert_eq!(restored.pc(), 2);
        assert_eq!(restored.stack(), &[7, 0x7fff]);
        assert_eq!(restored.memory(), vm.memory());
        assert_eq!(restored.pending_input(), 3);
    }

    #[test]
    fn test_snapshot_requires_chunks() {
        let mut iff = IffFile::new();
        iff.add_chunk(*b"REGS", vec![0; 18]);
        assert!(from_bytes(&iff.to_bytes())
            .err()
            .is_some_and(|e| e.contains("MEMR")));

        let mut iff = IffFile::new();
        iff.add_chunk(*b"MEMR", vec![0; 4]);
        assert!(from_bytes(&iff.to_bytes())
            .err()
            .is_some_and(|e| e.contains("REGS")));

        let mut other = IffFile::new();
        other.form_type = *b"IFZS";
        assert!(from_bytes(&other.to_bytes()).is_err());
        assert!(from_bytes(b"FORM").is_err());
    }
}
