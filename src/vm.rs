use crate::display::{DisplayError, MessageSink};
use crate::error::RuntimeError;
use crate::instruction::{Instruction, Opcode, Operand, MASK, MODULUS, REGISTER_COUNT};
use crate::interface::RegisterState;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;

/// Words of addressable memory (15-bit addresses)
pub const MEMORY_SIZE: usize = 32768;

/// The result of one successfully executed instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub instruction: Instruction,
    /// Character printed by `out`, if any
    pub output: Option<char>,
}

/// Why a headless run stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Halted,
    /// Blocked on an `in` with nothing buffered
    NeedInput,
    /// Ran the requested number of steps
    LimitReached,
    Error(RuntimeError),
}

/// Machine state: memory, registers, stack and program counter
#[derive(Clone)]
pub struct VirtualMachine {
    pub(crate) memory: Vec<u16>,
    pub(crate) registers: [u16; REGISTER_COUNT],
    pub(crate) stack: Vec<u16>,
    pub(crate) pc: u16,
    pub(crate) input: VecDeque<u16>,
    halted: bool,
    steps: u64,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    /// A machine with zeroed memory
    pub fn new() -> Self {
        VirtualMachine {
            memory: vec![0; MEMORY_SIZE],
            registers: [0; REGISTER_COUNT],
            stack: Vec::new(),
            pc: 0,
            input: VecDeque::with_capacity(32),
            halted: false,
            steps: 0,
        }
    }

    /// Load a program given as memory words, starting at address 0
    pub fn from_words(words: &[u16]) -> Result<Self, String> {
        if words.len() > MEMORY_SIZE {
            return Err(format!(
                "Program is {} words, memory only holds {}",
                words.len(),
                MEMORY_SIZE
            ));
        }
        let mut vm = Self::new();
        vm.memory[..words.len()].copy_from_slice(words);
        debug!("Loaded {} words", words.len());
        Ok(vm)
    }

    /// Load a little-endian binary image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() % 2 != 0 {
            warn!("Image has an odd number of bytes, ignoring the last one");
        }
        let words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::from_words(&words)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|e| format!("Cannot read image '{}': {}", path.display(), e))?;
        Self::from_bytes(&bytes)
    }

    /// Load from a string of hex words, four digits per word (`"00130041"`)
    pub fn from_hex_sequence(sequence: &str) -> Result<Self, String> {
        let sequence = sequence.trim();
        if sequence.len() % 4 != 0 {
            return Err("Sequence should be a multiple of 16 bits!".to_string());
        }
        let words = (0..sequence.len() / 4)
            .map(|i| {
                let chunk = sequence
                    .get(i * 4..i * 4 + 4)
                    .ok_or_else(|| "Sequence contains non-ASCII characters".to_string())?;
                u16::from_str_radix(chunk, 16)
                    .map_err(|_| format!("Malformed sequence word: {chunk}"))
            })
            .collect::<Result<Vec<u16>, String>>()?;
        Self::from_words(&words)
    }

    pub fn memory(&self) -> &[u16] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u16] {
        &mut self.memory
    }

    /// Read a memory word; the address is taken modulo the address space
    pub fn read(&self, address: u16) -> u16 {
        self.memory[(address & MASK) as usize]
    }

    pub fn write(&mut self, address: u16, value: u16) {
        self.memory[(address & MASK) as usize] = value;
    }

    pub fn registers(&self) -> &[u16; REGISTER_COUNT] {
        &self.registers
    }

    pub fn register(&self, index: usize) -> Result<u16, String> {
        self.registers
            .get(index)
            .copied()
            .ok_or_else(|| format!("No register R{index}"))
    }

    pub fn set_register(&mut self, index: usize, value: u16) -> Result<(), String> {
        let slot = self
            .registers
            .get_mut(index)
            .ok_or_else(|| format!("No register R{index}"))?;
        *slot = value;
        Ok(())
    }

    pub fn stack(&self) -> &[u16] {
        &self.stack
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn set_pc(&mut self, address: u16) {
        self.pc = address & MASK;
        self.halted = false;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn steps_executed(&self) -> u64 {
        self.steps
    }

    /// Number of characters waiting to be read by `in`
    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    /// Queue characters for `in`. Non-ASCII characters are dropped.
    pub fn push_input(&mut self, text: &str) {
        self.input.extend(
            text.chars()
                .filter(|ch| ch.is_ascii())
                .map(|ch| ch as u16),
        );
    }

    pub fn register_snapshot(&self) -> RegisterState {
        RegisterState {
            registers: self.registers,
            stack_depth: self.stack.len(),
            program_counter: self.pc,
        }
    }

    /// Push the registers selected by `mask` (bit n = Rn) in ascending order
    pub fn save_registers(&mut self, mask: u8) {
        for index in 0..REGISTER_COUNT {
            if mask & (1 << index) != 0 {
                self.stack.push(self.registers[index]);
            }
        }
    }

    /// Undo [`save_registers`](Self::save_registers) with the same mask.
    ///
    /// A stack too shallow for the mask is an error and changes nothing.
    pub fn restore_registers(&mut self, mask: u8) -> Result<(), RuntimeError> {
        if self.stack.len() < mask.count_ones() as usize {
            return Err(RuntimeError::StackEmpty { address: self.pc });
        }
        for index in (0..REGISTER_COUNT).rev() {
            if mask & (1 << index) != 0 {
                if let Some(value) = self.stack.pop() {
                    self.registers[index] = value;
                }
            }
        }
        Ok(())
    }

    fn value(&self, operand: Operand) -> u16 {
        match operand {
            Operand::Literal(v) => v,
            Operand::Register(r) => self.registers[r as usize],
            // Decoding rejects these
            Operand::Invalid(v) => v & MASK,
        }
    }

    fn target(&self, inst: &Instruction) -> Result<usize, RuntimeError> {
        match inst.operands[0] {
            Operand::Register(r) => Ok(r as usize),
            _ => Err(RuntimeError::RegisterExpected {
                address: inst.address,
            }),
        }
    }

    /// Execute the instruction at the program counter.
    ///
    /// On error the machine state is left untouched, so an `in` that returned
    /// [`RuntimeError::InputNeeded`] can be retried once input is queued.
    pub fn step(&mut self) -> Result<Step, RuntimeError> {
        if self.halted {
            return Err(RuntimeError::Halted);
        }

        let address = self.pc;
        let inst = Instruction::decode(&self.memory, address as usize)?;
        let ops = &inst.operands;
        let mut next_pc = ((address as usize + inst.len()) as u16) & MASK;
        let mut output = None;

        trace!("{:04x}: {}", address, inst);

        match inst.opcode {
            Opcode::Halt => {
                self.halted = true;
                return Err(RuntimeError::Halted);
            }
            Opcode::Set => {
                let a = self.target(&inst)?;
                self.registers[a] = self.value(ops[1]);
            }
            Opcode::Push => {
                let a = self.value(ops[0]);
                self.stack.push(a);
            }
            Opcode::Pop => {
                let a = self.target(&inst)?;
                let value = self.stack.pop().ok_or(RuntimeError::StackEmpty { address })?;
                self.registers[a] = value;
            }
            Opcode::Eq => {
                let a = self.target(&inst)?;
                self.registers[a] = (self.value(ops[1]) == self.value(ops[2])) as u16;
            }
            Opcode::Gt => {
                let a = self.target(&inst)?;
                self.registers[a] = (self.value(ops[1]) > self.value(ops[2])) as u16;
            }
            Opcode::Jmp => {
                next_pc = self.value(ops[0]) & MASK;
            }
            Opcode::Jt => {
                if self.value(ops[0]) != 0 {
                    next_pc = self.value(ops[1]) & MASK;
                }
            }
            Opcode::Jf => {
                if self.value(ops[0]) == 0 {
                    next_pc = self.value(ops[1]) & MASK;
                }
            }
            Opcode::Add => {
                let a = self.target(&inst)?;
                let sum = self.value(ops[1]) as u32 + self.value(ops[2]) as u32;
                self.registers[a] = (sum % MODULUS) as u16;
            }
            Opcode::Mult => {
                let a = self.target(&inst)?;
                let product = self.value(ops[1]) as u32 * self.value(ops[2]) as u32;
                self.registers[a] = (product % MODULUS) as u16;
            }
            Opcode::Mod => {
                let a = self.target(&inst)?;
                let divisor = self.value(ops[2]);
                if divisor == 0 {
                    return Err(RuntimeError::DivisionByZero { address });
                }
                self.registers[a] = self.value(ops[1]) % divisor;
            }
            Opcode::And => {
                let a = self.target(&inst)?;
                self.registers[a] = self.value(ops[1]) & self.value(ops[2]);
            }
            Opcode::Or => {
                let a = self.target(&inst)?;
                self.registers[a] = self.value(ops[1]) | self.value(ops[2]);
            }
            Opcode::Not => {
                let a = self.target(&inst)?;
                self.registers[a] = !self.value(ops[1]) & MASK;
            }
            Opcode::Rmem => {
                let a = self.target(&inst)?;
                self.registers[a] = self.read(self.value(ops[1]));
            }
            Opcode::Wmem => {
                let a = self.value(ops[0]);
                let b = self.value(ops[1]);
                self.write(a, b);
            }
            Opcode::Call => {
                self.stack.push(next_pc);
                next_pc = self.value(ops[0]) & MASK;
            }
            Opcode::Ret => match self.stack.pop() {
                Some(target) => next_pc = target & MASK,
                None => {
                    debug!("RET with empty stack at {:04x}, halting", address);
                    self.halted = true;
                    return Err(RuntimeError::Halted);
                }
            },
            Opcode::Out => {
                let code = self.value(ops[0]) as u32;
                output = Some(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            Opcode::In => {
                let a = self.target(&inst)?;
                match self.input.pop_front() {
                    Some(ch) => self.registers[a] = ch,
                    None => return Err(RuntimeError::InputNeeded),
                }
            }
            Opcode::Noop => {}
        }

        self.pc = next_pc;
        self.steps += 1;
        Ok(Step {
            instruction: inst,
            output,
        })
    }

    /// Run without any controller until the machine halts, needs input,
    /// fails, or `limit` steps have executed
    pub fn run_until_blocked(
        &mut self,
        limit: Option<u64>,
        sink: &mut impl MessageSink,
    ) -> Result<RunOutcome, DisplayError> {
        let mut executed = 0u64;
        loop {
            if let Some(max) = limit {
                if executed >= max {
                    sink.flush()?;
                    return Ok(RunOutcome::LimitReached);
                }
            }
            match self.step() {
                Ok(step) => {
                    executed += 1;
                    if let Some(ch) = step.output {
                        sink.print_char(ch)?;
                    }
                }
                Err(RuntimeError::Halted) => {
                    sink.flush()?;
                    return Ok(RunOutcome::Halted);
                }
                Err(RuntimeError::InputNeeded) => {
                    sink.flush()?;
                    return Ok(RunOutcome::NeedInput);
                }
                Err(e) => {
                    sink.flush()?;
                    return Ok(RunOutcome::Error(e));
                }
            }
        }
    }
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[PC:{:04x}; R:{:?}; stack {:?}; steps {}]",
            self.pc, self.registers, self.stack, self.steps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::HeadlessDisplay;
    use test_log::test;

    #[test]
    fn test_load_little_endian() {
        let vm = VirtualMachine::from_bytes(&[0x13, 0x00, 0x41, 0x00, 0x00, 0x00, 0xff]).unwrap();
        assert_eq!(&vm.memory()[..3], &[19, 65, 0]);
        assert_eq!(vm.memory().len(), MEMORY_SIZE);
        assert_eq!(vm.pc(), 0);
    }

    #[test]
    fn test_load_too_large() {
        let words = vec![0u16; MEMORY_SIZE + 1];
        assert!(VirtualMachine::from_words(&words).is_err());
    }

    #[test]
    fn test_hex_sequence() {
        let vm = VirtualMachine::from_hex_sequence("0013004100000015").unwrap();
        assert_eq!(&vm.memory()[..4], &[19, 65, 0, 21]);
        assert!(VirtualMachine::from_hex_sequence("001").is_err());
        assert!(VirtualMachine::from_hex_sequence("zzzz").is_err());
    }

    #[test]
    fn test_out_and_halt() {
        let mut vm = VirtualMachine::from_words(&[19, 72, 19, 105, 0]).unwrap();
        let mut display = HeadlessDisplay::new();
        let outcome = vm.run_until_blocked(None, &mut display).unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(display.output(), "Hi");
        assert!(vm.is_halted());
        assert_eq!(vm.pc(), 4);
        assert_eq!(vm.step(), Err(RuntimeError::Halted));
    }

    #[test]
    fn test_arithmetic_wraps() {
        // add r0 32758 15; mult r1 r0 3; not r2 0
        let mut vm = VirtualMachine::from_words(&[
            9, 32768, 32758, 15, 10, 32769, 32768, 3, 14, 32770, 0,
        ])
        .unwrap();
        vm.step().unwrap();
        assert_eq!(vm.registers()[0], 5);
        vm.step().unwrap();
        assert_eq!(vm.registers()[1], 15);
        vm.step().unwrap();
        assert_eq!(vm.registers()[2], 0x7fff);
    }

    #[test]
    fn test_mod_by_zero_leaves_state() {
        let mut vm = VirtualMachine::from_words(&[11, 32768, 7, 0]).unwrap();
        assert_eq!(vm.step(), Err(RuntimeError::DivisionByZero { address: 0 }));
        assert_eq!(vm.pc(), 0);
        assert_eq!(vm.steps_executed(), 0);
    }

    #[test]
    fn test_input_retry() {
        // in r0; out r0; halt
        let mut vm = VirtualMachine::from_words(&[20, 32768, 19, 32768, 0]).unwrap();
        assert_eq!(vm.step(), Err(RuntimeError::InputNeeded));
        assert_eq!(vm.pc(), 0);

        vm.push_input("é!");
        assert_eq!(vm.pending_input(), 1);
        vm.step().unwrap();
        assert_eq!(vm.registers()[0], '!' as u16);
        let step = vm.step().unwrap();
        assert_eq!(step.output, Some('!'));
    }

    #[test]
    fn test_call_and_ret() {
        // 0: call 4; 2: halt; 3: noop; 4: ret
        let mut vm = VirtualMachine::from_words(&[17, 4, 0, 21, 18]).unwrap();
        vm.step().unwrap();
        assert_eq!(vm.pc(), 4);
        assert_eq!(vm.stack(), &[2]);
        vm.step().unwrap();
        assert_eq!(vm.pc(), 2);
        assert!(vm.stack().is_empty());
    }

    #[test]
    fn test_ret_on_empty_stack_halts() {
        let mut vm = VirtualMachine::from_words(&[18]).unwrap();
        assert_eq!(vm.step(), Err(RuntimeError::Halted));
        assert!(vm.is_halted());
    }

    #[test]
    fn test_pop_empty_stack() {
        let mut vm = VirtualMachine::from_words(&[3, 32768]).unwrap();
        assert_eq!(vm.step(), Err(RuntimeError::StackEmpty { address: 0 }));
    }

    #[test]
    fn test_literal_destination() {
        let mut vm = VirtualMachine::from_words(&[1, 5, 5]).unwrap();
        assert_eq!(vm.step(), Err(RuntimeError::RegisterExpected { address: 0 }));
    }

    #[test]
    fn test_register_save_restore() {
        let mut vm = VirtualMachine::new();
        for i in 0..8 {
            vm.set_register(i, i as u16 * 10).unwrap();
        }
        let mask = 0b0111_1001; // r0, r3..r6
        vm.save_registers(mask);
        assert_eq!(vm.stack(), &[0, 30, 40, 50, 60]);

        for i in 0..8 {
            vm.set_register(i, 999).unwrap();
        }
        vm.restore_registers(mask).unwrap();
        assert_eq!(vm.registers(), &[0, 999, 999, 30, 40, 50, 60, 999]);
        assert!(vm.stack().is_empty());
        assert!(vm.restore_registers(1).is_err());
        assert!(vm.set_register(8, 0).is_err());
    }

    #[test]
    fn test_short_stack_restores_nothing() {
        let mut vm = VirtualMachine::new();
        vm.set_register(3, 7).unwrap();
        vm.set_register(4, 8).unwrap();
        vm.save_registers(0b0000_1000);

        assert!(matches!(
            vm.restore_registers(0b0001_1000),
            Err(RuntimeError::StackEmpty { .. })
        ));
        assert_eq!(vm.registers()[3], 7);
        assert_eq!(vm.registers()[4], 8);
        assert_eq!(vm.stack(), &[7]);
    }

    #[test]
    fn test_run_limit() {
        // jmp 0 forever
        let mut vm = VirtualMachine::from_words(&[6, 0]).unwrap();
        let mut display = HeadlessDisplay::new();
        let outcome = vm.run_until_blocked(Some(100), &mut display).unwrap();
        assert_eq!(outcome, RunOutcome::LimitReached);
        assert_eq!(vm.steps_executed(), 100);
    }
}
