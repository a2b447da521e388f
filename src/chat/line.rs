use std::fmt;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::Behavior;
use crate::ssh::session::SessionHandle;

pub const MAX_LINE_LENGTH: usize = 4096;

/// Line sent back when a completed line is not valid UTF-8.
pub const INVALID_DATA_NOTICE: &str = "*** GOT INVALID DATA\r\n";

const ERASE: &[u8] = b"\x08 \x08";
const BEL: u8 = 0x07;

/// Something the editor completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Enter was pressed; the raw line without its terminator.
    Line(Vec<u8>),
    /// Ctrl+D.
    EndOfTransmission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeState {
    Normal,
    GotEsc,
    GotCsi,
}

/// Byte-at-a-time line editing with remote echo.
///
/// Only append, backspace, kill-line and enter are supported. Escape
/// sequences (arrow keys and the like) are swallowed so they never end up
/// in a line.
#[derive(Debug)]
pub struct LineEditor {
    buffer: Vec<u8>,
    esc_state: EscapeState,
    after_cr: bool,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            esc_state: EscapeState::Normal,
            after_cr: false,
        }
    }
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Process one input byte, returning (echo_bytes, completed_input).
    pub fn feed(&mut self, byte: u8) -> (Vec<u8>, Option<Input>) {
        let after_cr = std::mem::replace(&mut self.after_cr, false);

        match self.esc_state {
            EscapeState::GotEsc => {
                self.esc_state = if byte == b'[' {
                    EscapeState::GotCsi
                } else {
                    EscapeState::Normal
                };
                return (Vec::new(), None);
            }
            EscapeState::GotCsi => {
                // Parameters and intermediates run until a final byte.
                if !(0x40..=0x7e).contains(&byte) {
                    return (Vec::new(), None);
                }
                self.esc_state = EscapeState::Normal;
                return (Vec::new(), None);
            }
            EscapeState::Normal => {}
        }

        match byte {
            // CR LF counts as one enter.
            b'\n' if after_cr => (Vec::new(), None),
            b'\r' | b'\n' => {
                self.after_cr = byte == b'\r';
                let line = std::mem::take(&mut self.buffer);
                (b"\r\n".to_vec(), Some(Input::Line(line)))
            }
            0x7f | 0x08 => {
                if self.erase_char() {
                    (ERASE.to_vec(), None)
                } else {
                    (Vec::new(), None)
                }
            }
            0x04 => (Vec::new(), Some(Input::EndOfTransmission)),
            // Ctrl+U
            0x15 => {
                let mut echo = Vec::new();
                while self.erase_char() {
                    echo.extend_from_slice(ERASE);
                }
                (echo, None)
            }
            0x1b => {
                self.esc_state = EscapeState::GotEsc;
                (Vec::new(), None)
            }
            _ if byte >= 0x20 || byte == b'\t' => {
                if self.buffer.len() >= MAX_LINE_LENGTH {
                    return (vec![BEL], None);
                }
                self.buffer.push(byte);
                (vec![byte], None)
            }
            _ => (Vec::new(), None),
        }
    }

    /// Drop the last character, including all bytes of a multi-byte UTF-8
    /// sequence. Returns false when the buffer was already empty.
    fn erase_char(&mut self) -> bool {
        let Some(mut last) = self.buffer.pop() else {
            return false;
        };
        while last & 0xc0 == 0x80 {
            match self.buffer.last() {
                Some(&prev) if prev & 0xc0 == 0x80 || prev >= 0xc0 => {
                    self.buffer.pop();
                    last = prev;
                    if prev >= 0xc0 {
                        break;
                    }
                }
                _ => break,
            }
        }
        true
    }
}

/// Why the interactive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// The user typed `exit`.
    Exit,
    /// Ctrl+D.
    EndOfTransmission,
    /// The channel reached end of input.
    Eof,
    /// The session was cancelled.
    Cancelled,
    /// The transport went away before a shell was opened.
    TransportClosed,
    /// The running flag was cleared from outside.
    Stopped,
}

impl fmt::Display for Ending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ending::Exit => write!(f, "exit"),
            Ending::EndOfTransmission => write!(f, "end-of-transmission"),
            Ending::Eof => write!(f, "eof"),
            Ending::Cancelled => write!(f, "cancelled"),
            Ending::TransportClosed => write!(f, "transport-closed"),
            Ending::Stopped => write!(f, "stopped"),
        }
    }
}

/// Bytes read from the channel per iteration.
const READ_CHUNK: usize = 1024;

/// Hand `out` to this session's own client, waiting for outbox space.
/// Returns false when cancelled while waiting. A closed outbox only matters
/// to the session itself and is not an error here.
async fn flush(handle: &SessionHandle, out: &mut Vec<u8>, cancel: &CancellationToken) -> bool {
    if out.is_empty() {
        return true;
    }
    let chunk = std::mem::take(out);
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = handle.deliver(chunk) => {
            if let Err(e) = sent {
                trace!(error = %e, "Dropping output");
            }
            true
        }
    }
}

/// Run the interactive line protocol until `exit`, Ctrl+D, end of input or
/// cancellation.
///
/// The greeting and first prompt go out before anything is read. Each
/// completed line is trimmed and handed to `behavior`; a line that is not
/// UTF-8 gets [`INVALID_DATA_NOTICE`] instead. The prompt is shown again
/// after every line. Everything produced for one read is sent back as a
/// single chunk.
pub async fn run<R>(
    mut reader: R,
    handle: &SessionHandle,
    behavior: &dyn Behavior,
    cancel: &CancellationToken,
) -> Result<Ending>
where
    R: AsyncRead + Unpin,
{
    let mut editor = LineEditor::new();
    let mut ending = Ending::Stopped;
    let mut out = behavior.greeting(handle).into_bytes();
    out.extend_from_slice(behavior.prompt(handle).as_bytes());
    if !flush(handle, &mut out, cancel).await {
        return Ok(Ending::Cancelled);
    }

    let mut buf = [0u8; READ_CHUNK];
    while handle.is_running() {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(Ending::Cancelled),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(Ending::Eof);
        }

        for &byte in &buf[..n] {
            let (echo, input) = editor.feed(byte);
            out.extend_from_slice(&echo);

            match input {
                None => {}
                Some(Input::EndOfTransmission) => {
                    handle.clear_running();
                    ending = Ending::EndOfTransmission;
                }
                Some(Input::Line(raw)) => {
                    match std::str::from_utf8(&raw) {
                        Ok(text) => {
                            let line = text.trim();
                            if line == "exit" {
                                debug!(user = ?handle.username(), "Exit requested");
                                handle.clear_running();
                                ending = Ending::Exit;
                            }
                            if let Some(response) = behavior.on_line(handle, line) {
                                out.extend_from_slice(response.as_bytes());
                            }
                        }
                        Err(_) => out.extend_from_slice(INVALID_DATA_NOTICE.as_bytes()),
                    }
                    out.extend_from_slice(behavior.prompt(handle).as_bytes());
                }
            }

            // Input after exit or Ctrl+D is discarded.
            if !handle.is_running() {
                break;
            }
        }

        if !flush(handle, &mut out, cancel).await {
            return Ok(Ending::Cancelled);
        }
    }

    Ok(ending)
}
