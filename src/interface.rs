//! The seam between a running machine and whatever is driving it

use crate::display::MessageSink;
use crate::instruction::REGISTER_COUNT;
use log::{error, info, trace};
use std::collections::VecDeque;
use std::io::{self, BufRead};

/// Register file, stack depth and program counter at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterState {
    pub registers: [u16; REGISTER_COUNT],
    pub stack_depth: usize,
    pub program_counter: u16,
}

/// One executed instruction, as reported to the UI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramStep {
    /// Registers *before* the instruction ran
    pub registers: RegisterState,
    /// Human readable form of the instruction
    pub instruction: String,
}

impl ProgramStep {
    pub fn step(registers: RegisterState, instruction: String) -> Self {
        Self {
            registers,
            instruction,
        }
    }
}

/// How the dispatcher is currently scheduling steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Actively executing instructions
    Running,
    /// Suspended until told otherwise
    Paused,
    /// Running, but suspends after this many more instructions
    PauseAfterSteps(usize),
    /// Running, but suspends after executing an instruction at or containing the address
    PauseAfterAddress(u16),
    /// Stopped for good
    Terminated,
}

impl RuntimeState {
    /// True when the dispatcher should wait for a command instead of stepping
    pub fn blocks(&self) -> bool {
        matches!(self, RuntimeState::Paused | RuntimeState::PauseAfterSteps(0))
    }
}

/// Commands the UI can send to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmCommand {
    Run,
    Pause,
    /// Switch between running and paused
    Toggle,
    SingleStep,
    RunForSteps(usize),
    RunUntilAddress(u16),
    /// Milliseconds to sleep between steps, and whether to pause right away
    SetCommandDelay(u64, bool),
    Terminate,
    SetProgramCounter(u16),
    SetRegister(u8, u16),
    ToggleBreakpoint(u16),
    /// Write a disassembly listing of memory
    SaveListing(String),
    SaveState(String),
    LoadState(String),
    TraceOperations(String),
    TraceStop,
}

/// What the machine side of the seam needs
pub trait VmInterface {
    fn write_output(&mut self, c: char) -> io::Result<()>;
    fn write_step(&mut self, step: ProgramStep) -> io::Result<()>;
    fn runtime_err(&mut self, message: String);
    /// A command with a side effect (a file written or loaded) succeeded
    fn notice(&mut self, message: String) {
        info!("{}", message);
    }
    /// Block until a line of input is available
    fn read_input(&mut self) -> String;
    /// Fetch the next command, waiting for one if `blocking`
    fn read_command(&mut self, blocking: bool) -> Option<VmCommand>;
    /// The machine has stopped and will not produce anything else
    fn finished(&mut self);
}

/// What the UI side of the seam needs
pub trait UiInterface {
    fn read_output(&mut self) -> Option<String>;
    fn read_steps(&mut self) -> Vec<ProgramStep>;
    fn read_errors(&mut self) -> Vec<String>;
    fn read_notices(&mut self) -> Vec<String>;
    fn need_input(&self) -> bool;
    fn is_finished(&self) -> bool;
    fn write_input(&mut self, input: &str) -> io::Result<()>;
    fn write_command(&mut self, command: VmCommand) -> io::Result<()>;
}

/// Headless controller: scripted input first, then lines from `reader`.
///
/// There is no one to send commands, so a paused machine stops for good.
pub struct StdioInterface<S: MessageSink, R: BufRead> {
    script: VecDeque<String>,
    reader: R,
    sink: S,
    errors: Vec<String>,
}

impl<S: MessageSink, R: BufRead> StdioInterface<S, R> {
    pub fn new(script: Vec<String>, reader: R, sink: S) -> Self {
        Self {
            script: script.into(),
            reader,
            sink,
            errors: Vec::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runtime errors reported so far
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl<S: MessageSink, R: BufRead> VmInterface for StdioInterface<S, R> {
    fn write_output(&mut self, c: char) -> io::Result<()> {
        self.sink
            .print_char(c)
            .map_err(|e| io::Error::other(e.message))
    }

    fn write_step(&mut self, step: ProgramStep) -> io::Result<()> {
        trace!("{:04x}: {}", step.registers.program_counter, step.instruction);
        Ok(())
    }

    fn runtime_err(&mut self, message: String) {
        error!("{}", message);
        self.errors.push(message);
    }

    fn read_input(&mut self) -> String {
        let _ = self.sink.flush();
        if let Some(mut line) = self.script.pop_front() {
            info!("Scripted input: {}", line);
            if !line.ends_with('\n') {
                line.push('\n');
            }
            return line;
        }

        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(_) => line,
            Err(e) => {
                error!("Could not read input: {}", e);
                String::new()
            }
        }
    }

    fn read_command(&mut self, _blocking: bool) -> Option<VmCommand> {
        None
    }

    fn finished(&mut self) {
        let _ = self.sink.flush();
    }
}
