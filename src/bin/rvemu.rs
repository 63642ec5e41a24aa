use clap::Parser;
use clap_num::maybe_hex;
use rustyline::DefaultEditor;

use rv32i_emu::hart::Trap;
use rv32i_emu::register_file::RegisterFile;
use rv32i_emu::{elf_loader, Hart};

/// A user-mode emulator for the RV32I base integer instruction set.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a statically linked RV32I ELF binary to run.
    binary: String,

    /// Print the instruction count and pc every time it is a multiple
    /// of `instruction_log_interval`.
    #[arg(short, long)]
    verbose: bool,

    /// Disable the fatal self-jump guard (a branch or jump whose
    /// target is its own address normally halts execution instead of
    /// spinning forever).
    #[arg(long)]
    no_self_jump_guard: bool,

    /// Drop into the same prompt `ebreak` uses as soon as pc reaches
    /// this address (use 0x prefix for hexadecimal).
    #[arg(short, long, value_parser=maybe_hex::<u32>)]
    break_at: Option<u32>,

    /// How often (in retired instructions) to print a progress line
    /// when `--verbose` is set.
    #[arg(long, default_value_t = 1_000_000)]
    instruction_log_interval: u64,
}

fn dump_registers(hart: &Hart) {
    for index in 0..32 {
        let name = RegisterFile::name_of(index).unwrap_or("?");
        eprintln!("  {name:>4} = {:#010x}", hart.registers().read(index).unwrap_or(0));
    }
    eprintln!("  {:>4} = {:#010x}", "pc", hart.pc());
}

/// Handle an `ebreak` trap the way an in-circuit debugger would: stop
/// and wait for the operator to say "go on", without offering any of
/// the breakpoint/stepping UI this emulator leaves out of scope.
fn prompt_to_continue(editor: &mut DefaultEditor, pc: u32) -> bool {
    eprintln!("breakpoint hit at pc {pc:#010x}");
    match editor.readline("(rvemu, press enter to continue, 'q' to quit) ") {
        Ok(line) => line.trim() != "q",
        Err(_) => false,
    }
}

fn main() {
    let args = Args::parse();

    let bytes = match std::fs::read(&args.binary) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("rvemu: failed to read {}: {e}", args.binary);
            std::process::exit(1);
        }
    };

    let mut hart = match elf_loader::load(&bytes) {
        Ok(hart) => hart,
        Err(e) => {
            eprintln!("rvemu: failed to load {}: {e}", args.binary);
            std::process::exit(1);
        }
    }
    .with_self_jump_guard(!args.no_self_jump_guard);

    let mut editor = DefaultEditor::new().expect("failed to initialise interactive prompt");

    loop {
        if args.break_at == Some(hart.pc()) {
            if !prompt_to_continue(&mut editor, hart.pc()) {
                std::process::exit(0);
            }
        }

        match hart.step() {
            Ok(()) => {
                if args.verbose
                    && args.instruction_log_interval > 0
                    && hart.instret() % args.instruction_log_interval == 0
                {
                    eprintln!(
                        "rvemu: {} instructions retired, pc = {:#010x}",
                        hart.instret(),
                        hart.pc()
                    );
                }
            }
            Err(Trap::GuestExit(code)) => {
                std::process::exit(code);
            }
            Err(Trap::Breakpoint(pc)) => {
                if !prompt_to_continue(&mut editor, pc) {
                    std::process::exit(0);
                }
                // step() does not retire a trapping ebreak, so resuming
                // must skip past it by hand or it would refire forever.
                hart.set_pc(pc.wrapping_add(4));
            }
            Err(trap) => {
                eprintln!("rvemu: fatal trap after {} instructions: {trap}", hart.instret());
                dump_registers(&hart);
                std::process::exit(1);
            }
        }
    }
}
