//! Channel-backed interfaces for running the machine on its own thread

use crate::interface::{ProgramStep, UiInterface, VmCommand, VmInterface};
use log::{debug, warn};
use std::io::{Error, ErrorKind, Result as IoResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Build a connected UI/VM pair. Move the VM half to the machine thread.
pub fn make_interfaces() -> (ThreadUiInterface, ThreadVmInterface) {
    let (command_out, command_in) = mpsc::channel();
    let (input_out, input_in) = mpsc::channel();
    let (output_out, output_in) = mpsc::channel();
    let (steps_out, steps_in) = mpsc::channel();
    let (errors_out, errors_in) = mpsc::channel();
    let (notices_out, notices_in) = mpsc::channel();
    let need_input = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let ui = ThreadUiInterface {
        need_input: need_input.clone(),
        finished: finished.clone(),
        command_outgoing: command_out,
        input_outgoing: input_out,
        output_incoming: output_in,
        steps_incoming: steps_in,
        errors_incoming: errors_in,
        notices_incoming: notices_in,
    };
    let vm = ThreadVmInterface {
        need_input,
        finished,
        command_incoming: command_in,
        input_incoming: input_in,
        output_outgoing: output_out,
        steps_outgoing: steps_out,
        errors_outgoing: errors_out,
        notices_outgoing: notices_out,
    };
    (ui, vm)
}

pub struct ThreadUiInterface {
    need_input: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    command_outgoing: Sender<VmCommand>,
    input_outgoing: Sender<String>,
    output_incoming: Receiver<char>,
    steps_incoming: Receiver<ProgramStep>,
    errors_incoming: Receiver<String>,
    notices_incoming: Receiver<String>,
}

pub struct ThreadVmInterface {
    need_input: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    command_incoming: Receiver<VmCommand>,
    input_incoming: Receiver<String>,
    output_outgoing: Sender<char>,
    steps_outgoing: Sender<ProgramStep>,
    errors_outgoing: Sender<String>,
    notices_outgoing: Sender<String>,
}

fn disconnected(what: &str) -> Error {
    Error::new(ErrorKind::BrokenPipe, format!("Could not send {what}"))
}

impl UiInterface for ThreadUiInterface {
    fn read_output(&mut self) -> Option<String> {
        let buffer: String = self.output_incoming.try_iter().collect();
        if buffer.is_empty() {
            None
        } else {
            Some(buffer)
        }
    }

    fn read_steps(&mut self) -> Vec<ProgramStep> {
        self.steps_incoming.try_iter().collect()
    }

    fn read_errors(&mut self) -> Vec<String> {
        self.errors_incoming.try_iter().collect()
    }

    fn read_notices(&mut self) -> Vec<String> {
        self.notices_incoming.try_iter().collect()
    }

    fn need_input(&self) -> bool {
        self.need_input.load(Ordering::Relaxed)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    fn write_input(&mut self, input: &str) -> IoResult<()> {
        // Cleared before sending, the machine may ask again as soon as it has the line
        self.need_input.store(false, Ordering::Relaxed);
        self.input_outgoing.send(input.to_string()).map_err(|_| {
            self.need_input.store(true, Ordering::Relaxed);
            disconnected("input")
        })
    }

    fn write_command(&mut self, command: VmCommand) -> IoResult<()> {
        self.command_outgoing
            .send(command)
            .map_err(|_| disconnected("command"))
    }
}

impl VmInterface for ThreadVmInterface {
    fn write_output(&mut self, c: char) -> IoResult<()> {
        self.output_outgoing
            .send(c)
            .map_err(|_| disconnected("output"))
    }

    fn write_step(&mut self, step: ProgramStep) -> IoResult<()> {
        self.steps_outgoing
            .send(step)
            .map_err(|_| disconnected("step"))
    }

    fn runtime_err(&mut self, message: String) {
        warn!("{}", message);
        let _ = self.errors_outgoing.send(message);
    }

    fn notice(&mut self, message: String) {
        debug!("{}", message);
        let _ = self.notices_outgoing.send(message);
    }

    fn read_input(&mut self) -> String {
        // Only the most recent request for input gets answered
        for stale in self.input_incoming.try_iter() {
            debug!("Discarding stale input {:?}", stale);
        }

        self.need_input.store(true, Ordering::Relaxed);
        match self.input_incoming.recv() {
            Ok(line) => {
                let mut input = line;
                input.extend(self.input_incoming.try_iter());
                input
            }
            Err(_) => String::new(),
        }
    }

    fn read_command(&mut self, blocking: bool) -> Option<VmCommand> {
        if blocking {
            self.command_incoming.recv().ok()
        } else {
            self.command_incoming.try_recv().ok()
        }
    }

    fn finished(&mut self) {
        self.need_input.store(false, Ordering::Relaxed);
        self.finished.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{run_program, RunOptions};
    use crate::test_utils::load_program;
    use std::thread;
    use std::time::{Duration, Instant};
    use test_log::test;

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_channels_carry_everything() {
        let (mut ui, mut vm) = make_interfaces();
        vm.write_output('a').unwrap();
        vm.write_output('b').unwrap();
        vm.write_step(ProgramStep::default()).unwrap();
        vm.runtime_err("oops".to_string());
        vm.notice("saved".to_string());

        assert_eq!(ui.read_output(), Some("ab".to_string()));
        assert_eq!(ui.read_output(), None);
        assert_eq!(ui.read_steps().len(), 1);
        assert_eq!(ui.read_errors(), vec!["oops".to_string()]);
        assert_eq!(ui.read_notices(), vec!["saved".to_string()]);

        ui.write_command(VmCommand::Pause).unwrap();
        assert_eq!(vm.read_command(false), Some(VmCommand::Pause));
        assert_eq!(vm.read_command(false), None);

        assert!(!ui.is_finished());
        vm.finished();
        assert!(ui.is_finished());
    }

    #[test]
    fn test_hung_up_ui() {
        let (ui, mut vm) = make_interfaces();
        drop(ui);
        assert!(vm.write_output('x').is_err());
        assert_eq!(vm.read_command(true), None);
        assert_eq!(vm.read_input(), "");
    }

    #[test]
    fn test_repeated_input_requests() {
        let (mut ui, mut vm) = make_interfaces();
        let rounds = 200;
        let reader = thread::spawn(move || {
            (0..rounds).map(|_| vm.read_input()).collect::<Vec<String>>()
        });

        for round in 0..rounds {
            wait_for(|| ui.need_input());
            ui.write_input(&format!("{round}\n")).unwrap();
        }
        let lines = reader.join().unwrap();
        assert_eq!(lines.len(), rounds);
        assert_eq!(lines[rounds - 1], format!("{}\n", rounds - 1));
        assert!(!ui.need_input());
    }

    #[test]
    fn test_failed_input_keeps_request() {
        let (mut ui, vm) = make_interfaces();
        vm.need_input.store(true, Ordering::Relaxed);
        drop(vm);
        assert!(ui.write_input("late\n").is_err());
        assert!(ui.need_input());
    }

    #[test]
    fn test_machine_thread() {
        let (mut ui, mut vm_side) = make_interfaces();
        let handle = thread::spawn(move || {
            let mut vm = load_program("in r0; out r0; in r0; out r0; halt");
            let options = RunOptions {
                start_paused: true,
                ..Default::default()
            };
            run_program(&mut vm, &mut vm_side, &options);
            vm.is_halted()
        });

        ui.write_command(VmCommand::Run).unwrap();
        wait_for(|| ui.need_input());
        ui.write_input("hi").unwrap();
        wait_for(|| ui.is_finished());

        assert!(handle.join().unwrap());
        assert_eq!(ui.read_output(), Some("hi".to_string()));
        assert!(ui.read_steps().last().is_some_and(|s| s.instruction == "HALT"));
    }
}
