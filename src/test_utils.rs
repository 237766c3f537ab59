// Helpers for building small machine programs in tests
use crate::display::HeadlessDisplay;
use crate::instruction::Instruction;
use crate::vm::{RunOutcome, VirtualMachine};

/// Assemble `source` at address 0 and load it
pub fn load_program(source: &str) -> VirtualMachine {
    let words = Instruction::assemble(source).expect("test program should assemble");
    VirtualMachine::from_words(&words).expect("test program should fit in memory")
}

/// Write a length-prefixed table of words at `address`
pub fn write_table(vm: &mut VirtualMachine, address: u16, words: &[u16]) {
    vm.write(address, words.len() as u16);
    for (i, word) in words.iter().enumerate() {
        vm.write(address + 1 + i as u16, *word);
    }
}

/// Write `text` XOR-ed with `key` as a length-prefixed string
pub fn write_obfuscated(vm: &mut VirtualMachine, address: u16, text: &str, key: u16) {
    let words: Vec<u16> = text.chars().map(|c| (c as u16) ^ key).collect();
    write_table(vm, address, &words);
}

/// Run until the machine stops, returning its outcome and everything it printed
pub fn run_capture(vm: &mut VirtualMachine, limit: u64) -> (RunOutcome, String) {
    let mut display = HeadlessDisplay::new();
    let outcome = vm
        .run_until_blocked(Some(limit), &mut display)
        .expect("headless display never fails");
    (outcome, display.output())
}
