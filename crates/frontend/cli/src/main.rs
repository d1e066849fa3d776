//! Terminal frontend for the Z80 single board computer emulator.
//!
//! Boots the machine from a BIOS and NVRAM image, renders the CGA text
//! framebuffer into the host terminal, and feeds keystrokes to the emulated
//! keyboard. `--iotest` instead drives the I/O bus directly from stdin for
//! scripted register level testing.

mod terminal;

use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use emu_sbc::SbcSystem;

/// Set by the SIGINT handler; the tick loop exits cleanly when it sees it.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "sbc80", about = "Z80 single board computer emulator")]
struct Args {
    /// BIOS ROM image path
    bios: String,

    /// NVRAM image path
    nvram: String,

    /// Floppy drive 0 image path
    #[arg(long)]
    d0: Option<String>,

    /// Floppy drive 1 image path
    #[arg(long)]
    d1: Option<String>,

    /// Program image loaded into RAM at 0x0100
    #[arg(long)]
    tpa: Option<String>,

    /// Log a per-instruction register trace to trace.txt
    #[arg(long)]
    trace: bool,

    /// Enable debug mode (debug.txt, RAM dump, stack usage report)
    #[arg(long)]
    debug: bool,

    /// Drive the I/O bus from stdin without running the CPU
    #[arg(long)]
    iotest: bool,
}

pub(crate) fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

#[cfg(unix)]
fn install_sigint_handler() {
    extern "C" fn handle_sigint(_signal: libc::c_int) {
        SHUTDOWN.store(true, Ordering::Relaxed);
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_sigint_handler() {}

/// Route device logs to debug.txt in debug mode, else standard behavior.
///
/// Both log files are truncated at startup.
fn init_logging(args: &Args) -> Result<()> {
    if args.trace {
        File::create("trace.txt").context("creating trace.txt")?;
    }

    if args.debug {
        let sink = File::create("debug.txt").context("creating debug.txt")?;
        env_logger::Builder::new()
            .target(env_logger::Target::Pipe(Box::new(sink)))
            .filter_level(log::LevelFilter::Trace)
            .init();
    } else {
        env_logger::init();
    }

    Ok(())
}

/// Format the register trace line used by trace mode and the debug report.
pub(crate) fn register_line(sys: &SbcSystem) -> String {
    let regs = sys.registers();
    format!(
        "PC:{}:{}:{:x}\tSP: {:#x}\tA:{:#x}\tBC:{:#x}\tDE:{:#x}\tHL:{:#x}\tIX:{:#x}\tIY:{:#x}",
        sys.machine.mmu.mode(),
        sys.machine.mmu.pri_bank(),
        regs.pc,
        regs.sp,
        regs.a,
        regs.bc,
        regs.de,
        regs.hl,
        regs.ix,
        regs.iy,
    )
}

/// Line driven I/O bus test mode.
///
/// Each line is `iPPPP` (read) or `oPPPPDD` (write) with the port and data
/// in hex; `#` starts a comment and an empty line ends the session.
fn run_iotest(sys: &mut SbcSystem) -> Result<()> {
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let cmd: String = line.chars().filter(|c| !c.is_whitespace()).collect();

        if cmd.is_empty() {
            break;
        }
        if cmd.starts_with('#') {
            continue;
        }
        if cmd.len() < 5 {
            anyhow::bail!("malformed iotest line: {}", line);
        }

        let port = u16::from_str_radix(&cmd[1..5], 16)
            .with_context(|| format!("bad port in iotest line: {}", line))?;

        match cmd.as_bytes()[0] {
            b'i' => {
                let value = sys.port_input(port);
                println!("{:#x} {}", value, value as char);
            }
            b'o' => {
                let data = u8::from_str_radix(&cmd[5..7], 16)
                    .with_context(|| format!("bad data in iotest line: {}", line))?;
                sys.port_output(port, data);
            }
            other => anyhow::bail!("unknown iotest op {:?}", other as char),
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    install_sigint_handler();

    let mut sys = SbcSystem::new();
    sys.set_debug(args.debug);
    sys.set_trace(args.trace);

    sys.load_rom(&args.bios)
        .with_context(|| format!("loading BIOS image {}", args.bios))?;
    sys.load_nvram(&args.nvram)
        .with_context(|| format!("loading NVRAM image {}", args.nvram))?;

    if let Some(tpa) = &args.tpa {
        let len = sys
            .load_tpa(tpa)
            .with_context(|| format!("loading TPA image {}", tpa))?;
        println!(
            "TPA page count: {}\n\nPress enter to start VM",
            len.div_ceil(256)
        );
        io::stdin().read_line(&mut String::new())?;
    }

    if let Some(d0) = &args.d0 {
        sys.attach_floppy(0, d0)
            .with_context(|| format!("loading floppy image {}", d0))?;
    }
    if let Some(d1) = &args.d1 {
        sys.attach_floppy(1, d1)
            .with_context(|| format!("loading floppy image {}", d1))?;
    }

    let run_result = if args.iotest {
        run_iotest(&mut sys)
    } else {
        terminal::run(&mut sys, args.trace)
    };

    // The shutdown path always runs, even when the machine died on a fault:
    // disks are written back first, then the debug artifacts
    let save_result = sys.save_floppy_images().context("writing floppy images");

    if args.debug {
        fs::write("memdump.bin", sys.machine.mmu.ram()).context("writing memdump.bin")?;
        println!("{}", register_line(&sys));
        print!("{}", sys.machine.mmu.stack_usage_report());
        io::stdout().flush()?;
    }

    run_result?;
    save_result?;

    Ok(())
}
