//! Boot disk image packer.
//!
//! Wraps an operating system binary in the boot sector header the BIOS
//! expects, pads the sector to 128 bytes, and fills the rest of the image
//! with the 0xE5 empty directory marker.

use std::fs;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use emu_sbc::floppy::IMAGE_SIZE;

/// Boot sector: magic, page count, destination address, jump address.
const HEADER_MAGIC: [u8; 2] = *b"ZB";
const LOAD_ADDRESS: [u8; 2] = [0x00, 0xC0];
const JUMP_ADDRESS: [u8; 2] = [0x00, 0xC0];

#[derive(Parser)]
#[command(name = "mkbootdisk", about = "Pack an OS binary into a bootable floppy image")]
struct Args {
    /// Operating system binary to embed
    input: String,

    /// Output disk image path
    output: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let os_image = fs::read(&args.input).with_context(|| format!("reading {}", args.input))?;
    let pages = os_image.len().div_ceil(256);
    ensure!(pages <= 0xFF, "OS image too large: {} pages", pages);

    let mut disk = Vec::with_capacity(IMAGE_SIZE);
    disk.extend_from_slice(&HEADER_MAGIC);
    disk.push(pages as u8);
    disk.extend_from_slice(&LOAD_ADDRESS);
    disk.extend_from_slice(&JUMP_ADDRESS);
    disk.push(0x01);
    disk.resize(128, 0x00);

    disk.extend_from_slice(&os_image);
    ensure!(
        disk.len() <= IMAGE_SIZE,
        "OS image does not fit the disk: {} bytes",
        os_image.len()
    );
    disk.resize(IMAGE_SIZE, 0xE5);

    fs::write(&args.output, &disk).with_context(|| format!("writing {}", args.output))?;
    println!("wrote {} ({} pages)", args.output, pages);

    Ok(())
}
