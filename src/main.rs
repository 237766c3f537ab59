use clap::{Parser, Subcommand};
use log::{debug, info};
use std::fs;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::thread;
use synvm::config::Config;
use synvm::decoder::{read_string, TableTransform};
use synvm::disassembler::Disassembler;
use synvm::dispatcher::{run_program, RunOptions};
use synvm::display::StdoutDisplay;
use synvm::interface::StdioInterface;
use synvm::patch::{apply_segments, Segment};
use synvm::route::{self, Route};
use synvm::thread_interface::make_interfaces;
use synvm::ui::{self, DebuggerUi, UiPaths};
use synvm::vm::VirtualMachine;

/// Hex word with or without a 0x prefix
fn parse_hex(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| format!("Invalid hex value: {s}"))
}

/// synvm - run, inspect and patch 15-bit VM images
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an image, in the terminal debugger when stdout is a tty
    Run {
        image: Option<PathBuf>,
        /// Load memory from hex words instead of an image file
        #[arg(long)]
        hex: Option<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Plain stdin/stdout even on a tty
        #[arg(long, default_value_t = false)]
        headless: bool,
        /// Write an execution trace
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Log jumps, calls and memory accesses
        #[arg(long)]
        access_log: Option<PathBuf>,
        /// Pause before executing at these addresses (hex)
        #[arg(short, long, value_parser = parse_hex)]
        breakpoint: Vec<u16>,
    },
    /// Disassemble an image
    Disasm {
        image: PathBuf,
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        start: u16,
        #[arg(long, default_value_t = 32)]
        count: usize,
        /// Write a full listing here instead
        #[arg(long)]
        listing: Option<PathBuf>,
        /// List length-prefixed strings of at least this length
        #[arg(long)]
        strings: Option<usize>,
    },
    /// Write words into an image
    Patch {
        image: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// AAAA:DDDD... with a hex word address and hex words
        #[arg(short, long)]
        segment: Vec<Segment>,
        /// AAAA:statements, assembled at the address
        #[arg(short, long, value_parser = Segment::parse_assembly)]
        assemble: Vec<Segment>,
    },
    /// Decode a length-prefixed string, or derive a code from a table
    Decode {
        image: PathBuf,
        #[arg(long, value_parser = parse_hex)]
        table: u16,
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        key: u16,
        /// Run the table transform and derive a code
        #[arg(long, default_value_t = false)]
        code: bool,
        #[arg(long, value_parser = parse_hex)]
        alphabet: Option<u16>,
        #[arg(long, value_parser = parse_hex, default_value = "0")]
        seed: u16,
        #[arg(long, default_value_t = 1)]
        rounds: u16,
        #[arg(long, default_value_t = 12)]
        length: usize,
        /// Take transform parameters from this config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Find the vault orb route
    Route {
        #[arg(long, default_value_t = 30)]
        target: u32,
        #[arg(long, default_value_t = 16)]
        max_steps: usize,
        /// Check this route (e.g. N,E,E,N) instead of searching
        #[arg(long)]
        check: Option<Route>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        Command::Run {
            image,
            hex,
            config,
            headless,
            trace,
            access_log,
            breakpoint,
        } => {
            let config = match config {
                Some(path) => Config::load(path)?,
                None => Config::default(),
            };
            let mut vm = match (hex, image) {
                (Some(sequence), _) => VirtualMachine::from_hex_sequence(&sequence)?,
                (None, Some(path)) => VirtualMachine::from_file(path)?,
                (None, None) => return Err("Give an image file or --hex".into()),
            };
            config.prepare(&mut vm)?;

            let interactive = atty::is(atty::Stream::Stdout) && !headless;
            let options = RunOptions {
                start_paused: interactive,
                delay_ms: config.machine.delay_ms,
                step_limit: config.machine.step_limit,
                trace_path: trace.or(config.trace.path.clone()),
                access_log,
                breakpoints: breakpoint,
            };
            if interactive {
                run_interactive(vm, &config, options)
            } else {
                run_headless(vm, &config, &options)
            }
        }
        Command::Disasm {
            image,
            start,
            count,
            listing,
            strings,
        } => {
            let vm = VirtualMachine::from_file(&image)?;
            let disasm = Disassembler::new(vm.memory());
            if let Some(min_len) = strings {
                for (address, text) in disasm.strings(min_len) {
                    println!("{address:04x}: {text:?}");
                }
            } else if let Some(path) = listing {
                let file = fs::File::create(&path)
                    .map_err(|e| format!("Cannot create '{}': {}", path.display(), e))?;
                disasm.write_listing(&mut BufWriter::new(file))?;
                info!("Listing written to {}", path.display());
            } else {
                for line in disasm.disassemble(start as usize, count) {
                    println!("{line}");
                }
            }
            Ok(())
        }
        Command::Patch {
            image,
            output,
            segment,
            assemble,
        } => {
            let mut bytes = fs::read(&image)
                .map_err(|e| format!("Cannot read image '{}': {}", image.display(), e))?;
            let segments: Vec<Segment> = segment.into_iter().chain(assemble).collect();
            if segments.is_empty() {
                return Err("Nothing to patch: give --segment or --assemble".into());
            }
            apply_segments(&mut bytes, &segments)?;
            fs::write(&output, bytes)
                .map_err(|e| format!("Cannot write '{}': {}", output.display(), e))?;
            println!("Wrote {} segments to {}", segments.len(), output.display());
            Ok(())
        }
        Command::Decode {
            image,
            table,
            key,
            code,
            alphabet,
            seed,
            rounds,
            length,
            config,
        } => {
            let mut vm = VirtualMachine::from_file(&image)?;
            if !code {
                println!("{}", read_string(vm.memory(), table, key)?);
                return Ok(());
            }
            let transform = match config {
                Some(path) => Config::load(path)?.transform.build()?,
                None => TableTransform::default(),
            };
            let alphabet = alphabet.ok_or("--code needs --alphabet")?;
            let code = transform.derive_code(vm.memory_mut(), table, alphabet, seed, rounds, length)?;
            println!("{code}");
            Ok(())
        }
        Command::Route {
            target,
            max_steps,
            check,
        } => {
            if let Some(route) = check {
                let walk = route.evaluate()?;
                println!(
                    "Ends at ({}, {}) with weight {}{}",
                    walk.x,
                    walk.y,
                    walk.weight,
                    if walk.at_door() { ", at the door" } else { "" }
                );
                return Ok(());
            }
            match route::solve(target, max_steps) {
                Some(route) => {
                    println!("{} ({} steps)", route, route.steps.len());
                    for command in route.commands() {
                        println!("{command}");
                    }
                    Ok(())
                }
                None => Err(format!("No route reaches {target} within {max_steps} steps").into()),
            }
        }
    }
}

fn run_headless(
    mut vm: VirtualMachine,
    config: &Config,
    options: &RunOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = io::stdin();
    let mut stdio = StdioInterface::new(
        config.input.script.clone(),
        stdin.lock(),
        StdoutDisplay::new(),
    );
    run_program(&mut vm, &mut stdio, options);
    debug!("Machine state at exit: {}", vm);

    match stdio.errors().last() {
        Some(error) => Err(error.clone().into()),
        None => Ok(()),
    }
}

fn run_interactive(
    mut vm: VirtualMachine,
    config: &Config,
    options: RunOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    // Nobody is waiting to hand the script over, so queue it up front
    for line in &config.input.script {
        vm.push_input(line);
        vm.push_input("\n");
    }

    let (mut ui_side, mut vm_side) = make_interfaces();
    let machine = thread::spawn(move || {
        run_program(&mut vm, &mut vm_side, &options);
        vm
    });

    let mut terminal = ui::start_ui()?;
    let result = DebuggerUi::new(UiPaths::default()).main_loop(&mut terminal, &mut ui_side);
    ui::stop_ui()?;
    // Dropping our side unblocks a machine waiting for input
    drop(ui_side);
    result?;

    match machine.join() {
        Ok(vm) => {
            debug!("Machine state at exit: {}", vm);
            Ok(())
        }
        Err(_) => Err("Machine thread panicked".into()),
    }
}
