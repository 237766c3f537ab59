//! Runtime errors raised while decoding or executing machine code

use std::fmt;

/// Everything that can stop a single step of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The program executed `halt` (or returned from an empty call stack)
    Halted,
    /// The word at `address` is not one of the 22 opcodes
    UnknownOpcode { address: u16, word: u16 },
    /// An operand word above the register range
    InvalidOperand { address: u16, word: u16 },
    /// A literal was found where the instruction writes to a register
    RegisterExpected { address: u16 },
    /// `pop` executed with nothing on the stack
    StackEmpty { address: u16 },
    /// `mod` with a zero divisor
    DivisionByZero { address: u16 },
    /// `in` executed while the input buffer was empty
    InputNeeded,
    /// A read or decode ran off the end of memory
    AddressOutOfRange(usize),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Halted => write!(f, "Program already finished."),
            RuntimeError::UnknownOpcode { address, word } => {
                write!(f, "Unknown operation with opcode {word:x} at {address:04x}.")
            }
            RuntimeError::InvalidOperand { address, word } => {
                write!(f, "Unknown operand with value {word:x} at {address:04x}.")
            }
            RuntimeError::RegisterExpected { address } => {
                write!(f, "Expected a register, got a literal value at {address:04x}.")
            }
            RuntimeError::StackEmpty { address } => {
                write!(f, "POP instruction executed with empty stack at {address:04x}.")
            }
            RuntimeError::DivisionByZero { address } => {
                write!(f, "MOD by zero at {address:04x}.")
            }
            RuntimeError::InputNeeded => {
                write!(f, "IN instruction executed while input buffer was empty.")
            }
            RuntimeError::AddressOutOfRange(addr) => {
                write!(f, "Address {addr:#06x} is outside of memory.")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<RuntimeError> for String {
    fn from(error: RuntimeError) -> String {
        error.to_string()
    }
}
