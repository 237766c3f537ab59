//! The top-level run loop: steps the machine while a controller steers it

use crate::disassembler::Disassembler;
use crate::error::RuntimeError;
use crate::interface::{ProgramStep, RuntimeState, VmCommand, VmInterface};
use crate::snapshot;
use crate::tracer::{AccessTracker, Tracer};
use crate::vm::VirtualMachine;
use indexmap::IndexSet;
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// How a run starts out
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Wait for a command before the first step
    pub start_paused: bool,
    /// Milliseconds to sleep between steps
    pub delay_ms: u64,
    /// Stop after this many steps
    pub step_limit: Option<u64>,
    /// Start an execution trace right away
    pub trace_path: Option<PathBuf>,
    /// Log control transfers and memory accesses here
    pub access_log: Option<PathBuf>,
    pub breakpoints: Vec<u16>,
}

struct Dispatcher {
    state: RuntimeState,
    delay_ms: u64,
    breakpoints: IndexSet<u16>,
    tracer: Option<Tracer>,
    access: Option<AccessTracker>,
}

impl Dispatcher {
    /// Apply a command. Returns true when the machine should execute an
    /// instruction right away, without stopping at a breakpoint.
    fn apply(
        &mut self,
        command: VmCommand,
        vm: &mut VirtualMachine,
        interface: &mut impl VmInterface,
    ) -> bool {
        use RuntimeState::*;
        use VmCommand::*;

        debug!("command: {:?}", command);
        match command {
            Run => self.state = Running,
            Pause => self.state = Paused,
            Toggle => {
                if self.state.blocks() {
                    self.state = Running;
                } else {
                    self.state = Paused;
                    return false;
                }
            }
            SingleStep => self.state = PauseAfterSteps(1),
            RunForSteps(0) => {
                self.state = Paused;
                return false;
            }
            RunForSteps(steps) => self.state = PauseAfterSteps(steps),
            RunUntilAddress(address) => self.state = PauseAfterAddress(address),
            SetCommandDelay(delay, pause) => {
                self.delay_ms = delay;
                if pause {
                    self.state = Paused;
                }
                return false;
            }
            Terminate => {
                self.state = Terminated;
                return false;
            }
            SetProgramCounter(address) => {
                vm.set_pc(address);
                return false;
            }
            SetRegister(register, value) => {
                if let Err(e) = vm.set_register(register as usize, value) {
                    interface.runtime_err(e);
                }
                return false;
            }
            ToggleBreakpoint(address) => {
                if !self.breakpoints.shift_remove(&address) {
                    self.breakpoints.insert(address);
                }
                info!("Breakpoints: {:04x?}", self.breakpoints);
                return false;
            }
            SaveListing(path) => {
                let result = File::create(&path).and_then(|file| {
                    Disassembler::new(vm.memory()).write_listing(&mut BufWriter::new(file))
                });
                match result {
                    Ok(()) => interface.notice(format!("Listing written to {path}")),
                    Err(e) => {
                        interface.runtime_err(format!("Could not write listing to {path}: {e}"))
                    }
                }
                return false;
            }
            SaveState(path) => {
                match snapshot::save_state(vm, &path) {
                    Ok(()) => interface.notice(format!("State saved to {path}")),
                    Err(e) => interface.runtime_err(e),
                }
                return false;
            }
            LoadState(path) => {
                match snapshot::load_state(&path) {
                    Ok(restored) => {
                        *vm = restored;
                        interface.notice(format!("State loaded from {path}"));
                    }
                    Err(e) => interface.runtime_err(e),
                }
                return false;
            }
            TraceOperations(path) => {
                match Tracer::create(&path, vm.pc()) {
                    Ok(tracer) => {
                        self.tracer = Some(tracer);
                        interface.notice(format!("Tracing to {path}"));
                    }
                    Err(e) => interface.runtime_err(format!("Error opening file {path}: {e}")),
                }
                return false;
            }
            TraceStop => {
                if self.tracer.take().is_some() {
                    interface.notice("Trace stopped".to_string());
                }
                return false;
            }
        }
        true
    }
}

/// Run `vm` under the control of `interface` until it halts or is terminated.
///
/// While the state is paused (or has no steps left) the loop blocks on the
/// next command; otherwise it only polls. A blocking read that yields
/// nothing means the controller has gone away, which ends the run.
pub fn run_program(
    vm: &mut VirtualMachine,
    interface: &mut impl VmInterface,
    options: &RunOptions,
) {
    use RuntimeState::*;

    let mut dispatcher = Dispatcher {
        state: if options.start_paused { Paused } else { Running },
        delay_ms: options.delay_ms,
        breakpoints: options.breakpoints.iter().copied().collect(),
        tracer: None,
        access: None,
    };
    if let Some(path) = &options.trace_path {
        match Tracer::create(path, vm.pc()) {
            Ok(tracer) => dispatcher.tracer = Some(tracer),
            Err(e) => interface.runtime_err(format!("Error opening trace {}: {e}", path.display())),
        }
    }
    if let Some(path) = &options.access_log {
        match AccessTracker::create(path) {
            Ok(tracker) => dispatcher.access = Some(tracker),
            Err(e) => interface.runtime_err(format!("Error opening log {}: {e}", path.display())),
        }
    }

    let mut executed: u64 = 0;
    loop {
        let must_block = match dispatcher.state {
            Terminated => break,
            state => state.blocks(),
        };

        let resumed = match interface.read_command(must_block) {
            Some(command) => {
                if !dispatcher.apply(command, vm, interface) {
                    continue;
                }
                true
            }
            None if must_block => {
                debug!("Controller hung up");
                break;
            }
            None => false,
        };

        if !resumed && dispatcher.breakpoints.contains(&vm.pc()) {
            info!("Breakpoint at {:04x}", vm.pc());
            dispatcher.state = Paused;
            continue;
        }

        if let Some(limit) = options.step_limit {
            if executed >= limit {
                interface.runtime_err(format!("Step limit of {limit} reached"));
                break;
            }
        }

        // Snapshot first: the instruction may overwrite its own registers
        let registers = vm.register_snapshot();
        let step_len = match vm.step() {
            Ok(step) => {
                executed += 1;
                let repr = step.instruction.to_string();
                if let Some(tracer) = dispatcher.tracer.as_mut() {
                    if let Err(e) = tracer.record(&step.instruction, &registers) {
                        interface.runtime_err(format!("Error while writing trace-line: {e}"));
                        dispatcher.tracer = None;
                    }
                }
                if let Some(access) = dispatcher.access.as_mut() {
                    if let Err(e) = access.instruction(&step.instruction, &registers) {
                        warn!("Access log failed: {e}");
                        dispatcher.access = None;
                    }
                }
                let sent = interface
                    .write_step(ProgramStep::step(registers.clone(), repr))
                    .and_then(|_| match step.output {
                        Some(ch) => interface.write_output(ch),
                        None => Ok(()),
                    });
                if sent.is_err() {
                    debug!("Output closed, stopping");
                    break;
                }
                step.instruction.len()
            }
            Err(RuntimeError::InputNeeded) => {
                let line = interface.read_input();
                if line.is_empty() {
                    info!("Input closed at {:04x}", vm.pc());
                    break;
                }
                vm.push_input(&line);
                continue;
            }
            Err(RuntimeError::Halted) => {
                let _ = interface.write_step(ProgramStep::step(registers, "HALT".into()));
                dispatcher.state = Terminated;
                continue;
            }
            Err(e) => {
                interface.runtime_err(e.to_string());
                dispatcher.state = Paused;
                continue;
            }
        };

        match dispatcher.state {
            Running | Paused | Terminated => (),
            PauseAfterSteps(n) => dispatcher.state = PauseAfterSteps(n.saturating_sub(1)),
            PauseAfterAddress(address) => {
                // Did the instruction just executed cover the address?
                let start = registers.program_counter as usize;
                if (start..start + step_len).contains(&(address as usize)) {
                    dispatcher.state = Paused;
                }
            }
        }

        if dispatcher.delay_ms > 0 {
            thread::sleep(Duration::from_millis(dispatcher.delay_ms));
        }
    }

    info!("Run finished after {} steps", executed);
    interface.finished();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::load_program;
    use std::collections::VecDeque;
    use std::io;
    use test_log::test;

    /// Hands out queued commands only when the dispatcher waits for one
    #[derive(Default)]
    struct ScriptedController {
        commands: VecDeque<VmCommand>,
        inputs: VecDeque<String>,
        output: String,
        steps: Vec<ProgramStep>,
        errors: Vec<String>,
        notices: Vec<String>,
        finished: bool,
    }

    impl ScriptedController {
        fn with_commands(commands: Vec<VmCommand>) -> Self {
            Self {
                commands: commands.into(),
                ..Default::default()
            }
        }
    }

    impl VmInterface for ScriptedController {
        fn write_output(&mut self, c: char) -> io::Result<()> {
            self.output.push(c);
            Ok(())
        }

        fn write_step(&mut self, step: ProgramStep) -> io::Result<()> {
            self.steps.push(step);
            Ok(())
        }

        fn runtime_err(&mut self, message: String) {
            self.errors.push(message);
        }

        fn notice(&mut self, message: String) {
            self.notices.push(message);
        }

        fn read_input(&mut self) -> String {
            self.inputs.pop_front().unwrap_or_default()
        }

        fn read_command(&mut self, blocking: bool) -> Option<VmCommand> {
            if blocking {
                self.commands.pop_front()
            } else {
                None
            }
        }

        fn finished(&mut self) {
            self.finished = true;
        }
    }

    fn paused() -> RunOptions {
        RunOptions {
            start_paused: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_runs_to_halt() {
        let mut vm = load_program("out 'H'; out 'i'; halt");
        let mut controller = ScriptedController::default();
        run_program(&mut vm, &mut controller, &RunOptions::default());

        assert_eq!(controller.output, "Hi");
        assert!(controller.finished);
        assert!(controller.errors.is_empty());
        assert_eq!(controller.steps.len(), 3);
        assert_eq!(controller.steps[0].instruction, "OUT  0048");
        assert_eq!(controller.steps[2].instruction, "HALT");
        assert_eq!(controller.steps[2].registers.program_counter, 4);
    }

    #[test]
    fn test_input_is_requested() {
        let mut vm = load_program("in r0; out r0; in r0; out r0; halt");
        let mut controller = ScriptedController::default();
        controller.inputs.push_back("ok".to_string());
        run_program(&mut vm, &mut controller, &RunOptions::default());
        assert_eq!(controller.output, "ok");
        assert!(vm.is_halted());
    }

    #[test]
    fn test_closed_input_ends_run() {
        let mut vm = load_program("in r0; halt");
        let mut controller = ScriptedController::default();
        run_program(&mut vm, &mut controller, &RunOptions::default());
        assert!(controller.finished);
        assert_eq!(vm.pc(), 0);
        assert!(!vm.is_halted());
    }

    #[test]
    fn test_single_steps() {
        let mut vm = load_program("noop; noop; noop; halt");
        let mut controller =
            ScriptedController::with_commands(vec![VmCommand::SingleStep, VmCommand::SingleStep]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(vm.steps_executed(), 2);
        assert_eq!(vm.pc(), 2);
        assert_eq!(controller.steps.len(), 2);
    }

    #[test]
    fn test_run_for_steps_and_toggle() {
        let mut vm = load_program("noop; noop; noop; noop; out 'z'; halt");
        let mut controller = ScriptedController::with_commands(vec![
            VmCommand::RunForSteps(3),
            VmCommand::Toggle,
        ]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(controller.output, "z");
        assert!(vm.is_halted());
    }

    #[test]
    fn test_breakpoint_pauses_and_resumes() {
        let mut vm = load_program("noop; noop; noop; out 'x'; halt");
        let mut options = paused();
        options.breakpoints = vec![3];

        let mut controller = ScriptedController::with_commands(vec![VmCommand::Run]);
        run_program(&mut vm.clone(), &mut controller, &options);
        assert_eq!(controller.output, "");
        assert_eq!(controller.steps.len(), 3);

        let mut controller =
            ScriptedController::with_commands(vec![VmCommand::Run, VmCommand::Run]);
        run_program(&mut vm, &mut controller, &options);
        assert_eq!(controller.output, "x");
        assert!(vm.is_halted());
    }

    #[test]
    fn test_toggle_breakpoint_command() {
        let mut vm = load_program("noop; noop; halt");
        let mut controller = ScriptedController::with_commands(vec![
            VmCommand::ToggleBreakpoint(1),
            VmCommand::ToggleBreakpoint(2),
            VmCommand::ToggleBreakpoint(1),
            VmCommand::Run,
        ]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(vm.pc(), 2);
        assert!(!vm.is_halted());
    }

    #[test]
    fn test_run_until_address() {
        let mut vm = load_program("noop; set r0 1; noop; halt");
        // Address 2 is inside the `set` at 1
        let mut controller =
            ScriptedController::with_commands(vec![VmCommand::RunUntilAddress(2)]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(vm.pc(), 4);
        assert_eq!(vm.registers()[0], 1);
        assert_eq!(vm.steps_executed(), 2);
    }

    #[test]
    fn test_run_until_address_self_modifying() {
        // The wmem turns its own opcode into a noop, but it was still three words long
        let mut vm = load_program("wmem 0 21; noop; noop; halt");
        let mut controller =
            ScriptedController::with_commands(vec![VmCommand::RunUntilAddress(2)]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(vm.read(0), 21);
        assert_eq!(vm.pc(), 3);
        assert_eq!(vm.steps_executed(), 1);
    }

    #[test]
    fn test_file_commands_report_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.svms").to_string_lossy().into_owned();
        let missing = dir.path().join("no/such/listing.txt").to_string_lossy().into_owned();

        let mut vm = load_program("halt");
        let mut controller = ScriptedController::with_commands(vec![
            VmCommand::SaveState(state.clone()),
            VmCommand::SaveListing(missing.clone()),
            VmCommand::TraceStop,
        ]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(controller.notices, vec![format!("State saved to {state}")]);
        assert_eq!(controller.errors.len(), 1);
        assert!(controller.errors[0].starts_with(&format!("Could not write listing to {missing}")));
    }

    #[test]
    fn test_error_pauses() {
        let mut vm = load_program("mod r0 1 0; halt");
        let mut controller = ScriptedController::default();
        run_program(&mut vm, &mut controller, &RunOptions::default());
        assert_eq!(controller.errors, vec!["MOD by zero at 0000.".to_string()]);
        assert!(controller.finished);
        assert!(!vm.is_halted());
    }

    #[test]
    fn test_register_and_pc_commands() {
        let mut vm = load_program("halt; halt; out r2; halt");
        let mut controller = ScriptedController::with_commands(vec![
            VmCommand::SetRegister(2, 'A' as u16),
            VmCommand::SetRegister(9, 1),
            VmCommand::SetProgramCounter(2),
            VmCommand::Run,
        ]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(controller.output, "A");
        assert_eq!(controller.errors.len(), 1);
    }

    #[test]
    fn test_step_limit() {
        let mut vm = load_program("loop: jmp loop");
        let mut controller = ScriptedController::default();
        let options = RunOptions {
            step_limit: Some(50),
            ..Default::default()
        };
        run_program(&mut vm, &mut controller, &options);
        assert_eq!(vm.steps_executed(), 50);
        assert!(controller.errors[0].contains("limit"));
        assert!(controller.finished);
    }

    #[test]
    fn test_terminate() {
        let mut vm = load_program("loop: jmp loop");
        let mut controller = ScriptedController::with_commands(vec![VmCommand::Terminate]);
        run_program(&mut vm, &mut controller, &paused());
        assert_eq!(vm.steps_executed(), 0);
        assert!(controller.finished);
    }
}
