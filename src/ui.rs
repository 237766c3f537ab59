//! Terminal debugger front-end
//!
//! The machine runs on its own thread behind a [`UiInterface`]; this side
//! draws registers, output and recent instructions, and turns keys into
//! [`VmCommand`]s.

use crate::interface::{ProgramStep, RegisterState, UiInterface, VmCommand};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    backend::CrosstermBackend,
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::border,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io::{self, stdout, Stdout};
use std::time::Duration;

pub type Tui = Terminal<CrosstermBackend<Stdout>>;

/// Executed instructions kept for the history pane
const MAX_HISTORY: usize = 256;
/// Bytes of program output kept for the terminal pane
const MAX_OUTPUT: usize = 64 * 1024;

pub fn start_ui() -> io::Result<Tui> {
    execute!(stdout(), EnterAlternateScreen)?;
    enable_raw_mode()?;
    Terminal::new(CrosstermBackend::new(stdout()))
}

pub fn stop_ui() -> io::Result<()> {
    execute!(stdout(), LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}

/// Where the file-producing keys write to
#[derive(Debug, Clone)]
pub struct UiPaths {
    pub trace: String,
    pub listing: String,
    pub state: String,
}

impl Default for UiPaths {
    fn default() -> Self {
        UiPaths {
            trace: "trace.txt".to_string(),
            listing: "listing.txt".to_string(),
            state: "state.svms".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DebuggerUi {
    paths: UiPaths,
    output: String,
    history: VecDeque<ProgramStep>,
    /// Latest machine error, shown until the next key or notice
    error: Option<String>,
    input_line: String,
    status: String,
    tracing: bool,
    exit: bool,
}

impl DebuggerUi {
    pub fn new(paths: UiPaths) -> Self {
        DebuggerUi {
            paths,
            status: "space: run/pause  n: step  t: trace  d: listing  s: save  q: quit".to_string(),
            ..Default::default()
        }
    }

    pub fn main_loop(&mut self, terminal: &mut Tui, vm: &mut impl UiInterface) -> io::Result<()> {
        while !self.exit {
            self.pull(vm);
            terminal.draw(|frame| self.render_frame(frame, vm.need_input()))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key, vm)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Collect whatever the machine has produced since the last frame
    pub fn pull(&mut self, vm: &mut impl UiInterface) {
        if let Some(text) = vm.read_output() {
            self.output.push_str(&text);
            if self.output.len() > MAX_OUTPUT {
                let mut cut = self.output.len() - MAX_OUTPUT;
                while !self.output.is_char_boundary(cut) {
                    cut += 1;
                }
                self.output.drain(..cut);
            }
        }
        for step in vm.read_steps() {
            if self.history.len() == MAX_HISTORY {
                self.history.pop_front();
            }
            self.history.push_back(step);
        }
        if let Some(notice) = vm.read_notices().pop() {
            self.status = notice;
            self.error = None;
        }
        if let Some(error) = vm.read_errors().pop() {
            self.error = Some(error);
        }
        if vm.is_finished() && !self.status.starts_with("Finished") {
            self.status = "Finished. q: quit".to_string();
        }
    }

    pub fn should_exit(&self) -> bool {
        self.exit
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn status(&self) -> &str {
        self.error.as_deref().unwrap_or(&self.status)
    }

    pub fn handle_key(&mut self, key: KeyEvent, vm: &mut impl UiInterface) -> io::Result<()> {
        if key.code == KeyCode::Esc {
            return self.quit(vm);
        }

        if vm.need_input() {
            match key.code {
                KeyCode::Char(c) => self.input_line.push(c),
                KeyCode::Backspace => {
                    self.input_line.pop();
                }
                KeyCode::Enter => {
                    let mut line = std::mem::take(&mut self.input_line);
                    line.push('\n');
                    debug!("Sending input {:?}", line);
                    vm.write_input(&line)?;
                }
                _ => {}
            }
            return Ok(());
        }

        self.error = None;
        match key.code {
            KeyCode::Char(' ') => vm.write_command(VmCommand::Toggle)?,
            KeyCode::Char('n') => vm.write_command(VmCommand::SingleStep)?,
            KeyCode::Char('t') => {
                if self.tracing {
                    vm.write_command(VmCommand::TraceStop)?;
                    self.status = "Stopping trace...".to_string();
                } else {
                    vm.write_command(VmCommand::TraceOperations(self.paths.trace.clone()))?;
                    self.status = format!("Starting trace to {}...", self.paths.trace);
                }
                self.tracing = !self.tracing;
            }
            KeyCode::Char('d') => {
                vm.write_command(VmCommand::SaveListing(self.paths.listing.clone()))?;
                self.status = format!("Writing listing to {}...", self.paths.listing);
            }
            KeyCode::Char('s') => {
                vm.write_command(VmCommand::SaveState(self.paths.state.clone()))?;
                self.status = format!("Saving state to {}...", self.paths.state);
            }
            KeyCode::Char('q') => return self.quit(vm),
            _ => {}
        }
        Ok(())
    }

    fn quit(&mut self, vm: &mut impl UiInterface) -> io::Result<()> {
        self.exit = true;
        // The machine may already be gone
        let _ = vm.write_command(VmCommand::Terminate);
        Ok(())
    }

    pub fn render_frame(&self, frame: &mut Frame, need_input: bool) {
        let root = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(4),
                Constraint::Min(3),
                Constraint::Length(3),
            ])
            .split(frame.size());
        let middle = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(20), Constraint::Length(32)])
            .split(root[1]);

        let default_step = ProgramStep::default();
        let current = self.history.back().unwrap_or(&default_step);
        frame.render_widget(&current.registers, root[0]);

        let visible = middle[0].height.saturating_sub(2) as usize;
        let lines: Vec<Line> = self
            .output
            .lines()
            .rev()
            .take(visible)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(Line::from)
            .collect();
        frame.render_widget(
            Paragraph::new(lines)
                .wrap(Wrap { trim: false })
                .block(titled("Terminal")),
            middle[0],
        );

        let visible = middle[1].height.saturating_sub(2) as usize;
        let skip = self.history.len().saturating_sub(visible);
        let steps: Vec<Line> = self
            .history
            .iter()
            .skip(skip)
            .map(|s| {
                Line::from(vec![
                    Span::styled(
                        format!("{:04x} ", s.registers.program_counter),
                        Style::default().fg(Color::DarkGray),
                    ),
                    Span::raw(s.instruction.clone()),
                ])
            })
            .collect();
        frame.render_widget(
            Paragraph::new(steps).block(titled("Instructions")),
            middle[1],
        );

        let status = if need_input {
            Line::from(vec![
                Span::styled("> ", Style::default().fg(Color::Yellow)),
                Span::raw(self.input_line.clone()),
            ])
        } else if let Some(error) = &self.error {
            Line::from(Span::styled(error.clone(), Style::default().fg(Color::Red)))
        } else {
            Line::from(self.status.clone())
        };
        frame.render_widget(Paragraph::new(status).block(titled("Status")), root[2]);
    }
}

fn titled(title: &str) -> Block<'_> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_set(border::THICK)
}

impl Widget for &RegisterState {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let bold = Style::default().add_modifier(Modifier::BOLD);
        let mut registers = Vec::with_capacity(16);
        for (i, value) in self.registers.iter().enumerate() {
            registers.push(Span::styled(format!("R{i} "), bold));
            registers.push(Span::raw(format!("{value:04x}  ")));
        }
        let text = vec![
            Line::from(registers),
            Line::from(vec![
                Span::styled("PC ", bold),
                Span::raw(format!("{:04x}  ", self.program_counter)),
                Span::styled("Stack ", bold),
                Span::raw(self.stack_depth.to_string()),
            ]),
        ];
        Paragraph::new(text)
            .block(titled("Registers"))
            .render(area, buf);
    }
}
