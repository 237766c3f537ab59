#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod decoder;
pub mod disassembler;
pub mod dispatcher;
pub mod display;
pub mod error;
pub mod instruction;
pub mod interface;
pub mod patch;
pub mod route;
pub mod snapshot;
pub mod thread_interface;
pub mod tracer;
pub mod ui;
pub mod vm;

#[cfg(test)]
mod test_utils;
