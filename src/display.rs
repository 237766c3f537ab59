//! Output sinks for characters the machine prints
//!
//! The message subsystem proper lives outside this crate. Everything the
//! machine or the decoder emits goes through [`MessageSink`], so callers can
//! render it however they like.

use log::debug;
use std::fmt;
use std::io::{self, BufWriter, Stdout, Write};

/// Receiver for printed characters
pub trait MessageSink {
    /// Print a single character
    fn print_char(&mut self, ch: char) -> Result<(), DisplayError>;

    /// Print a string
    fn print(&mut self, text: &str) -> Result<(), DisplayError> {
        for ch in text.chars() {
            self.print_char(ch)?;
        }
        Ok(())
    }

    /// Push anything buffered out to the user
    fn flush(&mut self) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Display error type
#[derive(Debug, Clone)]
pub struct DisplayError {
    pub message: String,
}

impl DisplayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Display error: {}", self.message)
    }
}

impl std::error::Error for DisplayError {}

impl From<io::Error> for DisplayError {
    fn from(error: io::Error) -> Self {
        Self::new(format!("I/O error: {}", error))
    }
}

impl From<DisplayError> for String {
    fn from(error: DisplayError) -> String {
        error.message
    }
}

/// Collects all output in memory, for tests and scripted runs
#[derive(Debug, Default)]
pub struct HeadlessDisplay {
    lines: Vec<String>,
    current_line: String,
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed lines, without the trailing partial line
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// All output as a single string
    pub fn output(&self) -> String {
        let mut output = String::new();
        for line in &self.lines {
            output.push_str(line);
            output.push('\n');
        }
        output.push_str(&self.current_line);
        output
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.current_line.clear();
    }
}

impl MessageSink for HeadlessDisplay {
    fn print_char(&mut self, ch: char) -> Result<(), DisplayError> {
        if ch == '\n' {
            let line = std::mem::take(&mut self.current_line);
            debug!("Headless: {}", line);
            self.lines.push(line);
        } else {
            self.current_line.push(ch);
        }
        Ok(())
    }
}

/// Writes straight to the process stdout
pub struct StdoutDisplay {
    out: BufWriter<Stdout>,
}

impl StdoutDisplay {
    pub fn new() -> Self {
        Self {
            out: BufWriter::new(io::stdout()),
        }
    }
}

impl Default for StdoutDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSink for StdoutDisplay {
    fn print_char(&mut self, ch: char) -> Result<(), DisplayError> {
        write!(self.out, "{ch}")?;
        // Line buffered, so prompts without newlines still need an explicit flush
        if ch == '\n' {
            self.out.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DisplayError> {
        self.out.flush()?;
        Ok(())
    }
}

impl Drop for StdoutDisplay {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}
