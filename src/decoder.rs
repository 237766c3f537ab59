//! Obfuscated text and the code-table transform
//!
//! Strings in memory are length prefixed: the word at the start address holds
//! the length `n`, and the characters follow in the next `n` words. Printed
//! strings may be XOR-obfuscated with a key held in a register.
//!
//! The table transform scrambles a length-prefixed table in place with a
//! multiply-add-modulo state, keyed by a byte-difference keystream, then picks
//! output characters through an index derived from the final state.

use crate::display::{DisplayError, MessageSink};
use crate::error::RuntimeError;
use crate::instruction::MASK;
use crate::vm::VirtualMachine;
use log::{debug, trace};
use std::fmt;

/// Registers the print routine preserves: R0 and R3 through R6
pub const PRINT_ROUTINE_SAVED: u8 = 0b0111_1001;

#[derive(Debug)]
pub enum DecodeError {
    Memory(RuntimeError),
    Display(DisplayError),
    /// A table that must have entries is empty
    EmptyTable(u16),
    InvalidParameters(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Memory(e) => write!(f, "{e}"),
            DecodeError::Display(e) => write!(f, "{e}"),
            DecodeError::EmptyTable(addr) => write!(f, "Table at {addr:04x} is empty"),
            DecodeError::InvalidParameters(msg) => write!(f, "Invalid transform: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<RuntimeError> for DecodeError {
    fn from(error: RuntimeError) -> Self {
        DecodeError::Memory(error)
    }
}

impl From<DisplayError> for DecodeError {
    fn from(error: DisplayError) -> Self {
        DecodeError::Display(error)
    }
}

/// Decode one character: `(value | key) & !(value & key)`, kept to 15 bits
pub fn decode_char(value: u16, key: u16) -> u16 {
    let both = !(value & key);
    (value | key) & both & MASK
}

fn to_char(word: u16) -> char {
    char::from_u32(word as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// The body of the length-prefixed table at `address`
pub fn read_length_prefixed(memory: &[u16], address: u16) -> Result<&[u16], RuntimeError> {
    let start = address as usize;
    let length = *memory
        .get(start)
        .ok_or(RuntimeError::AddressOutOfRange(start))? as usize;
    let end = start + 1 + length;
    if end > memory.len() {
        return Err(RuntimeError::AddressOutOfRange(end - 1));
    }
    Ok(&memory[start + 1..end])
}

/// Read a length-prefixed string, undoing `key` (0 for plain text)
pub fn read_string(memory: &[u16], address: u16, key: u16) -> Result<String, RuntimeError> {
    Ok(read_length_prefixed(memory, address)?
        .iter()
        .map(|w| to_char(decode_char(*w, key)))
        .collect())
}

/// Print the obfuscated string at `address`, decoding each character with `key`.
///
/// Returns the number of characters printed.
pub fn print_obfuscated(
    memory: &[u16],
    address: u16,
    key: u16,
    sink: &mut impl MessageSink,
) -> Result<u16, DecodeError> {
    let start = address as usize;
    let length = *memory
        .get(start)
        .ok_or(RuntimeError::AddressOutOfRange(start))?;

    let mut counter: u16 = 0;
    loop {
        let next = counter as usize + 1;
        if next > length as usize {
            break;
        }
        let slot = start + next;
        let word = *memory
            .get(slot)
            .ok_or(RuntimeError::AddressOutOfRange(slot))?;
        sink.print_char(to_char(decode_char(word, key)))?;
        counter = next as u16;
    }
    Ok(counter)
}

/// Run the print routine against live machine registers.
///
/// R0 holds the string address, R1 the per-character printer routine and R2
/// the key. R0 and R3-R6 are preserved on the machine stack; R1 is left
/// holding the final loop counter, as the routine does.
pub fn emulate_print_routine(
    vm: &mut VirtualMachine,
    sink: &mut impl MessageSink,
) -> Result<u16, DecodeError> {
    let table = vm.registers[0];
    let printer = vm.registers[1];
    let key = vm.registers[2];
    debug!(
        "print routine: table {:04x} printer {:04x} key {:04x}",
        table, printer, key
    );

    let depth = vm.stack.len();
    vm.save_registers(PRINT_ROUTINE_SAVED);
    // Scratch values the routine leaves in the saved registers
    vm.registers[6] = table;
    vm.registers[5] = printer;
    vm.registers[4] = vm.read(table);

    let result = print_obfuscated(&vm.memory, table, key, sink);
    if let Ok(count) = result {
        vm.registers[1] = count;
    }
    vm.restore_registers(PRINT_ROUTINE_SAVED)?;
    debug_assert_eq!(vm.stack.len(), depth);
    result
}

/// Opaque handle for a message the display is asked to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDescriptor {
    /// Address of the length-prefixed text
    pub address: u16,
    /// XOR key, `None` for plain text
    pub key: Option<u16>,
}

impl MessageDescriptor {
    pub fn plain(address: u16) -> Self {
        Self { address, key: None }
    }

    pub fn obfuscated(address: u16, key: u16) -> Self {
        Self {
            address,
            key: Some(key),
        }
    }
}

/// Resolve a descriptor against memory and hand the text to the sink
pub fn render_message(
    memory: &[u16],
    message: &MessageDescriptor,
    sink: &mut impl MessageSink,
) -> Result<u16, DecodeError> {
    // A zero key decodes to the input unchanged
    print_obfuscated(memory, message.address, message.key.unwrap_or(0), sink)
}

/// Parameters of the multiply-add-modulo state step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableTransform {
    multiplier: u16,
    increment: u16,
    modulus: u32,
}

impl Default for TableTransform {
    fn default() -> Self {
        TableTransform {
            multiplier: 5249,
            increment: 12345,
            modulus: 32768,
        }
    }
}

impl TableTransform {
    /// `modulus` must be in `1..=32768` so states stay 15-bit
    pub fn new(multiplier: u16, increment: u16, modulus: u32) -> Result<Self, DecodeError> {
        if modulus == 0 || modulus > 32768 {
            return Err(DecodeError::InvalidParameters(format!(
                "modulus {modulus} must be between 1 and 32768"
            )));
        }
        Ok(TableTransform {
            multiplier,
            increment,
            modulus,
        })
    }

    pub fn multiplier(&self) -> u16 {
        self.multiplier
    }

    pub fn increment(&self) -> u16 {
        self.increment
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// `(state * multiplier + increment) mod modulus`
    pub fn next_state(&self, state: u16) -> u16 {
        let wide = state as u64 * self.multiplier as u64 + self.increment as u64;
        (wide % self.modulus as u64) as u16
    }

    /// Byte difference of `word` (low minus high, mod 256) keyed by the low byte of `state`
    pub fn keystream(&self, word: u16, state: u16) -> u16 {
        let low = word & 0xff;
        let high = (word >> 8) & 0xff;
        let difference = low.wrapping_sub(high) & 0xff;
        decode_char(difference, state & 0xff)
    }

    /// Scramble the length-prefixed table at `table` in place.
    ///
    /// The outer loop runs `rounds` times over the whole table. Returns the
    /// final state; an empty table or zero rounds leaves the masked seed.
    pub fn transform(
        &self,
        memory: &mut [u16],
        table: u16,
        seed: u16,
        rounds: u16,
    ) -> Result<u16, DecodeError> {
        let start = table as usize;
        let length = read_length_prefixed(memory, table)?.len();

        let mut state = seed & MASK;
        let mut round: usize = 0;
        loop {
            if round + 1 > rounds as usize {
                break;
            }
            let mut j: usize = 0;
            loop {
                if j + 1 > length {
                    break;
                }
                let slot = start + 1 + j;
                let word = memory[slot];
                state = self.next_state(state.wrapping_add(word) & MASK);
                let key = self.keystream(word, state);
                memory[slot] = decode_char(word, key);
                trace!(
                    "round {} slot {:04x}: {:04x} -> {:04x} (state {:04x})",
                    round,
                    slot,
                    word,
                    memory[slot],
                    state
                );
                j += 1;
            }
            round += 1;
        }
        Ok(state)
    }

    /// Transform `table`, then emit `length` characters picked from the
    /// length-prefixed `alphabet` through an index derived from the state
    pub fn derive_code(
        &self,
        memory: &mut [u16],
        table: u16,
        alphabet: u16,
        seed: u16,
        rounds: u16,
        length: usize,
    ) -> Result<String, DecodeError> {
        // Both tables are checked before the table is scrambled in place
        if read_length_prefixed(memory, table)?.is_empty() {
            return Err(DecodeError::EmptyTable(table));
        }
        if read_length_prefixed(memory, alphabet)?.is_empty() {
            return Err(DecodeError::EmptyTable(alphabet));
        }

        let mut state = self.transform(memory, table, seed, rounds)?;
        let entries = read_length_prefixed(memory, table)?.to_vec();
        let symbols = read_length_prefixed(memory, alphabet)?;

        let mut code = String::with_capacity(length);
        for _ in 0..length {
            state = self.next_state(state);
            let index = state as usize % entries.len();
            let word = entries[index];
            let symbol = symbols[(word ^ state) as usize % symbols.len()];
            code.push(to_char(symbol));
        }
        debug!("derived code {:?} from table {:04x}", code, table);
        Ok(code)
    }
}
