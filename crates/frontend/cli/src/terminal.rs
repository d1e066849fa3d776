//! Raw mode terminal session
//!
//! Runs the tick loop against the host terminal: keystrokes are drained
//! from a non blocking stdin reader, translated for host quirks, and fed to
//! the emulated keyboard; the decoded CGA frame is painted every fiftieth
//! tick with ANSI colors and the hardware cursor position.

use std::fs;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use emu_sbc::{SbcSystem, TextFrame, TEXT_COLS, TEXT_ROWS};
use log::debug;
use termion::color::{AnsiValue, Bg, Fg};
use termion::raw::IntoRawMode;

/// Ticks between display refreshes.
const RENDER_INTERVAL: u64 = 50;

/// A translated host key press.
enum HostKey {
    /// Feed this byte to the emulated keyboard.
    Key(u8),
    /// The operator asked the emulator to stop.
    Shutdown,
}

enum Escape {
    /// The sequence continues beyond the buffered bytes.
    Incomplete,
    /// A parsed sequence of the given length, with its translation if any.
    Sequence(Option<u8>, usize),
}

/// Run the interactive tick loop until shutdown or a machine fault.
pub fn run(sys: &mut SbcSystem, trace: bool) -> Result<()> {
    let mut trace_out = if trace {
        let file = fs::OpenOptions::new()
            .append(true)
            .open("trace.txt")
            .context("opening trace.txt")?;
        Some(io::BufWriter::new(file))
    } else {
        None
    };

    let mut screen = io::stdout().into_raw_mode().context("entering raw mode")?;
    write!(
        screen,
        "{}{}",
        termion::clear::All,
        termion::cursor::Goto(1, 1)
    )?;
    screen.flush()?;

    let mut input = termion::async_stdin();
    let mut pending: Vec<u8> = Vec::new();
    let mut halt_reported = false;

    let result = (|| -> Result<()> {
        loop {
            if crate::shutdown_requested() {
                return Ok(());
            }

            if let Some(out) = trace_out.as_mut() {
                writeln!(out, "{}", crate::register_line(sys))?;
            }

            sys.step()?;

            // Drain whatever the terminal has buffered
            let mut chunk = [0u8; 64];
            loop {
                match input.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(count) => pending.extend_from_slice(&chunk[..count]),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err.into()),
                }
            }

            for key in translate_host_keys(&mut pending) {
                match key {
                    HostKey::Shutdown => return Ok(()),
                    HostKey::Key(byte) => sys.put_key(byte),
                }
            }

            if sys.ticks() % RENDER_INTERVAL == 0 {
                paint(&mut screen, &sys.render())?;
            }

            if sys.halted() {
                if !halt_reported {
                    debug!("cpu halted");
                    halt_reported = true;
                }
            } else {
                halt_reported = false;
            }
        }
    })();

    if let Some(out) = trace_out.as_mut() {
        let _ = out.flush();
    }

    // Leave the terminal usable regardless of how the loop ended
    write!(
        screen,
        "{}{}{}{}",
        termion::style::Reset,
        termion::clear::All,
        termion::cursor::Goto(1, 1),
        termion::cursor::Show
    )?;
    screen.flush()?;

    result
}

/// Translate buffered host bytes into emulated key presses.
///
/// Host quirks follow the source machine's terminal handling: the DEL byte
/// becomes backspace, LF becomes CR, the delete escape sequence forwards the
/// DEL byte, and END is read by the guest as ctrl-c. A raw 0x03 (ctrl-c in
/// raw mode) stops the emulator instead.
fn translate_host_keys(pending: &mut Vec<u8>) -> Vec<HostKey> {
    let mut keys = Vec::new();
    let mut index = 0;

    while index < pending.len() {
        let byte = pending[index];

        if byte == 0x1B {
            match parse_escape(&pending[index..]) {
                Escape::Incomplete => break,
                Escape::Sequence(translated, length) => {
                    if let Some(key) = translated {
                        keys.push(HostKey::Key(key));
                    }
                    index += length;
                }
            }
            continue;
        }

        keys.push(match byte {
            0x03 => HostKey::Shutdown,
            0x7F => HostKey::Key(0x08),
            0x0A => HostKey::Key(0x0D),
            other => HostKey::Key(other),
        });
        index += 1;
    }

    pending.drain(..index);
    keys
}

fn parse_escape(buf: &[u8]) -> Escape {
    if buf.len() == 1 {
        // A lone escape is the escape key itself
        return Escape::Sequence(Some(0x1B), 1);
    }

    match buf[1] {
        b'[' => {
            if buf.len() < 3 {
                return Escape::Incomplete;
            }
            match buf[2] {
                b'3' => {
                    if buf.len() < 4 {
                        return Escape::Incomplete;
                    }
                    // Delete key: forward the DEL byte
                    Escape::Sequence((buf[3] == b'~').then_some(0x7F), 4)
                }
                b'4' => {
                    if buf.len() < 4 {
                        return Escape::Incomplete;
                    }
                    // End key variant
                    Escape::Sequence((buf[3] == b'~').then_some(0x03), 4)
                }
                b'F' => Escape::Sequence(Some(0x03), 3),
                b'0'..=b'9' => {
                    // Skip any other numbered sequence through its final byte
                    for (length, &b) in buf.iter().enumerate().skip(3) {
                        if !b.is_ascii_digit() && b != b';' {
                            return Escape::Sequence(None, length + 1);
                        }
                    }
                    Escape::Incomplete
                }
                _ => Escape::Sequence(None, 3),
            }
        }
        b'O' => {
            if buf.len() < 3 {
                return Escape::Incomplete;
            }
            Escape::Sequence((buf[2] == b'F').then_some(0x03), 3)
        }
        _ => Escape::Sequence(Some(0x1B), 1),
    }
}

/// Paint a decoded frame, coalescing attribute changes between cells.
fn paint(out: &mut impl Write, frame: &TextFrame) -> io::Result<()> {
    write!(out, "{}", termion::cursor::Hide)?;

    for row in 0..TEXT_ROWS {
        write!(out, "{}", termion::cursor::Goto(1, row as u16 + 1))?;
        let mut style: Option<(u8, u8, bool)> = None;

        for col in 0..TEXT_COLS {
            let cell = &frame.cells[row * TEXT_COLS + col];
            let wanted = (cell.fore, cell.back, cell.blink);

            if style != Some(wanted) {
                write!(out, "{}{}", Fg(AnsiValue(cell.fore)), Bg(AnsiValue(cell.back)))?;
                if cell.blink {
                    write!(out, "{}", termion::style::Blink)?;
                } else {
                    write!(out, "{}", termion::style::NoBlink)?;
                }
                style = Some(wanted);
            }

            write!(out, "{}", cell.glyph as char)?;
        }
    }

    write!(out, "{}", termion::style::Reset)?;
    write!(
        out,
        "{}{}",
        termion::cursor::Goto(frame.cursor_col as u16 + 1, frame.cursor_row as u16 + 1),
        termion::cursor::Show
    )?;

    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(bytes: &[u8]) -> (Vec<Option<u8>>, usize) {
        let mut pending = bytes.to_vec();
        let translated = translate_host_keys(&mut pending);
        let mapped = translated
            .iter()
            .map(|key| match key {
                HostKey::Key(byte) => Some(*byte),
                HostKey::Shutdown => None,
            })
            .collect();
        (mapped, pending.len())
    }

    #[test]
    fn test_plain_bytes_pass_through() {
        let (mapped, left) = keys(b"ab");
        assert_eq!(mapped, vec![Some(b'a'), Some(b'b')]);
        assert_eq!(left, 0);
    }

    #[test]
    fn test_host_quirk_mapping() {
        let (mapped, _) = keys(&[0x7F, 0x0A]);
        assert_eq!(mapped, vec![Some(0x08), Some(0x0D)]);
    }

    #[test]
    fn test_ctrl_c_requests_shutdown() {
        let (mapped, _) = keys(&[0x03]);
        assert_eq!(mapped, vec![None]);
    }

    #[test]
    fn test_delete_sequence_forwards_del() {
        let (mapped, _) = keys(b"\x1b[3~");
        assert_eq!(mapped, vec![Some(0x7F)]);
    }

    #[test]
    fn test_end_key_reads_as_ctrl_c() {
        let (mapped, _) = keys(b"\x1b[F");
        assert_eq!(mapped, vec![Some(0x03)]);
        let (mapped, _) = keys(b"\x1bOF");
        assert_eq!(mapped, vec![Some(0x03)]);
        let (mapped, _) = keys(b"\x1b[4~");
        assert_eq!(mapped, vec![Some(0x03)]);
    }

    #[test]
    fn test_lone_escape_is_escape_key() {
        let (mapped, _) = keys(&[0x1B]);
        assert_eq!(mapped, vec![Some(0x1B)]);
    }

    #[test]
    fn test_unknown_sequences_dropped() {
        let (mapped, left) = keys(b"\x1b[Aq");
        assert_eq!(mapped, vec![Some(b'q')]);
        assert_eq!(left, 0);
    }

    #[test]
    fn test_incomplete_sequence_kept_pending() {
        let mut pending = b"\x1b[".to_vec();
        let translated = translate_host_keys(&mut pending);
        assert!(translated.is_empty());
        assert_eq!(pending, b"\x1b[");
    }
}
