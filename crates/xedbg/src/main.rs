use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use xedbg_core::backend::Memory;
use xedbg_core::breakpoints::builder::BreakpointBuilder;
use xedbg_core::config::ProcessorConfig;
use xedbg_core::events::{ChannelListener, DebugEvent, DebugEventReceiver};
use xedbg_core::ppc::encode::{addi, bc, cmpwi};
use xedbg_core::ppc::{self, Instruction, BLR, SYNC};
use xedbg_core::sim::SimMachine;
use xedbg_core::thread::GuestThread;
use xedbg_core::types::{GuestAddress, ThreadId};
use xedbg_core::{ExecutionState, Processor};
use xedbg_utils::{info, init_logging, init_logging_to_file, init_logging_with_level, LogFormat, LogLevel, LoggingGuard};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Load address of the demo image.
const DEMO_BASE: GuestAddress = GuestAddress::new(0x8200_0000);
/// How long the demo waits for any single event when no step timeout is configured.
const DEMO_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Execution control and debugging for a PowerPC guest.
#[derive(Parser, Debug)]
#[command(name = "xedbg")]
#[command(version)]
#[command(about = "Execution control and debugging for a PowerPC guest", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,
    /// Write logs to a dated file in this directory instead of stdout
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Decode a guest instruction word
    Decode
    {
        /// Instruction word (hex format: 0x4E800020 or decimal)
        #[arg(value_parser = parse_u32)]
        word: u32,
        /// Address the instruction lives at, used for relative branch targets
        #[arg(short, long, value_parser = parse_u32, default_value = "0x82000000")]
        address: u32,
    },
    /// Run a scripted debugging session against the in-memory guest
    Demo
    {
        /// Scenario to run
        #[arg(value_enum, default_value_t = Scenario::Breakpoint)]
        scenario: Scenario,
        /// Save the paused session to this file
        #[arg(long)]
        save_session: Option<PathBuf>,
    },
    /// Show the processor configuration read from the environment
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scenario
{
    /// Pause on a breakpoint and print the thread's frames
    Breakpoint,
    /// Single-step across a conditional branch
    Step,
    /// Run the paused thread forward to the next safe point
    SafePoint,
}

fn main()
{
    let cli = Cli::parse();

    // The guard keeps file output alive until the command finishes.
    let _guard = match init_cli_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_cli_logging(cli: &Cli) -> CliResult<LoggingGuard>
{
    if let Some(directory) = &cli.log_dir {
        let (path, guard) = init_logging_to_file(directory, cli.log_level.unwrap_or(LogLevel::Info))?;
        eprintln!("Logging to {}", path.display());
        return Ok(guard);
    }
    let guard = match cli.log_level {
        Some(level) => init_logging_with_level(level, cli.log_format)?,
        None => init_logging()?,
    };
    Ok(guard)
}

fn run_command(cli: Cli) -> CliResult<()>
{
    match cli.command {
        Commands::Decode { word, address } => {
            print_instruction(GuestAddress::new(address), word);
            Ok(())
        }
        Commands::Demo { scenario, save_session } => {
            let config = ProcessorConfig::from_env()?;
            info!(?scenario, "running demo");
            run_demo(config, scenario, save_session)
        }
        Commands::Config => {
            let config = ProcessorConfig::from_env()?;
            println!("Processor configuration:");
            println!("  Break on start: {}", config.break_on_start);
            println!("  Max stack frames: {}", config.max_stack_frames);
            match config.step_timeout {
                Some(timeout) => println!("  Step timeout: {}ms", timeout.as_millis()),
                None => println!("  Step timeout: none"),
            }
            println!("  Safe point scan limit: {}", config.safe_point_scan_limit);
            Ok(())
        }
    }
}

fn parse_u32(value: &str) -> Result<u32, String>
{
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => value.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid 32-bit value '{value}': {e}"))
}

fn print_instruction(address: GuestAddress, word: u32)
{
    let sync = if ppc::is_synchronizing_instruction(word) {
        " (synchronization point)"
    } else {
        ""
    };
    match ppc::decode(address, word) {
        Instruction::Branch(branch) => {
            print!("{address}: {word:08X}  {}", branch.mnemonic());
            if let Some(target) = branch.static_target() {
                print!(" {target}");
            }
            println!("{sync}");
        }
        Instruction::Other { opcode, .. } => println!("{address}: {word:08X}  opcode {opcode}{sync}"),
    }
}

/// Guest image shared by every scenario.
///
/// `r3` is set to 5 so the `beq` at instruction 2 is taken, skipping to 4.
/// A `sync` at instruction 5 gives the safe point scan something to find.
fn demo_program() -> Vec<u32>
{
    vec![
        addi(3, 0, 5),
        cmpwi(0, 3, 5),
        bc(12, 2, demo_address(2), demo_address(4)),
        addi(4, 0, 1),
        addi(4, 0, 2),
        SYNC,
        addi(3, 3, 1),
        BLR,
    ]
}

fn demo_address(index: u32) -> GuestAddress
{
    DEMO_BASE + index * 4
}

fn run_demo(config: ProcessorConfig, scenario: Scenario, save_session: Option<PathBuf>) -> CliResult<()>
{
    let event_timeout = config.step_timeout.unwrap_or(DEMO_EVENT_TIMEOUT);
    let machine = SimMachine::new(config);
    machine.load_guest_module("default.xex", DEMO_BASE, &demo_program());
    let (listener, events) = ChannelListener::new();
    let processor = machine.processor();
    processor.set_debug_listener(Some(listener));
    processor.pre_launch();
    if processor.execution_state() == ExecutionState::Paused {
        // Break-on-start leaves nothing to inspect before the first thread exists.
        processor.continue_execution();
        wait_for(&events, event_timeout, &DebugEvent::ExecutionContinued)?;
    }

    let breakpoint = processor.add_breakpoint(
        BreakpointBuilder::guest(demo_address(2))
            .with_callback(|hit| println!("  callback: breakpoint {} on thread {}", hit.breakpoint, hit.thread))
            .build(),
    );
    let thread = machine.spawn_thread(DEMO_BASE)?;
    println!("Spawned guest thread {} at {DEMO_BASE}", thread.id());
    wait_for_pause(&events, event_timeout)?;
    print_thread(processor, thread.id());

    match scenario {
        Scenario::Breakpoint => {}
        Scenario::Step => {
            for _ in 0..2 {
                processor.step_guest_instruction(thread.id())?;
                wait_for_pause(&events, event_timeout)?;
                print_current_instruction(processor, thread.pc());
            }
        }
        Scenario::SafePoint => {
            let safe_point = processor.step_to_guest_safe_point(thread.id(), false)?;
            println!("Safe point reached at {safe_point}");
            print_current_instruction(processor, thread.pc());
        }
    }

    if let Some(path) = save_session {
        let mut writer = BufWriter::new(File::create(&path)?);
        processor.save_session(&mut writer)?;
        println!("Session saved to {}", path.display());
    }

    processor.remove_breakpoint(breakpoint);
    processor.continue_execution();
    machine.join_thread(thread.id());
    println!(
        "Thread {} finished after {} instructions",
        thread.id(),
        thread.instructions_executed()
    );
    machine.shutdown();
    Ok(())
}

fn wait_for_pause(events: &DebugEventReceiver, timeout: Duration) -> CliResult<()>
{
    wait_for(events, timeout, &DebugEvent::ExecutionPaused)
}

fn wait_for(events: &DebugEventReceiver, timeout: Duration, wanted: &DebugEvent) -> CliResult<()>
{
    loop {
        let event = events.recv_timeout(timeout)?;
        println!("[event] {}", event.describe());
        if event == *wanted {
            return Ok(());
        }
    }
}

fn print_thread(processor: &Processor, thread: ThreadId)
{
    let Some(info) = processor.query_thread_debug_info(thread) else {
        println!("Thread {thread} is not tracked");
        return;
    };
    println!("\nThread {thread}:");
    println!("  State: {:?}", info.state());
    println!("  Suspended: {}", info.is_suspended());
    let context = info.guest_context();
    println!("  r3 = {:#x}  lr = {:#x}  cr = {:#010x}", context.gpr[3], context.lr, context.cr);
    println!("  Frames:");
    for frame in info.frames() {
        println!("    {} guest {} {}", frame.host_pc, frame.guest_pc, frame.name);
    }
}

fn print_current_instruction(processor: &Processor, pc: GuestAddress)
{
    match processor.memory().load_u32(pc) {
        Some(word) => print_instruction(pc, word),
        None => println!("{pc}: <unmapped>"),
    }
}
