//! Stream pump workers.
//!
//! One worker runs per attached terminal slot and one per desktop tunnel.
//! Each owns its source, pushes [`ServerMessage`]s into the connection's
//! outbound queue and stops when its [`CancellationToken`] fires or the
//! source ends.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{Stream, StreamExt};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ws::protocol::ServerMessage;

/// Incremental UTF-8 decoder. A multi-byte sequence split across two reads
/// is held back until the rest arrives; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Truncated sequence at the end: wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}

/// Settings shared by every terminal worker.
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub tick: Duration,
    pub chunk_size: usize,
}

/// Forward PTY output for one slot until cancelled, EOF/EIO, or the
/// connection's queue goes away.
pub async fn run_terminal_pump(
    terminal: u32,
    master: Arc<AsyncFd<File>>,
    output: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    settings: PumpSettings,
) {
    let mut buf = vec![0u8; settings.chunk_size.max(1)];
    let mut decoder = Utf8Decoder::default();

    loop {
        let ready = tokio::select! {
            () = cancel.cancelled() => break,
            r = tokio::time::timeout(settings.tick, master.readable()) => r,
        };
        let mut guard = match ready {
            // Tick elapsed with nothing to read; loop back to the cancel check.
            Err(_) => continue,
            Ok(Ok(guard)) => guard,
            Ok(Err(e)) => {
                warn!("Terminal {terminal}: poll failed: {e}");
                break;
            }
        };

        let n = match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.read(&mut buf)
        }) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            // EIO is how a PTY master reports that the slave side closed.
            Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => break,
            Ok(Err(e)) => {
                warn!("Terminal {terminal}: read failed: {e}");
                break;
            }
            Err(_would_block) => continue,
        };

        let data = decoder.decode(&buf[..n]);
        if data.is_empty() {
            continue;
        }
        let msg = ServerMessage::Output { terminal, data };
        tokio::select! {
            () = cancel.cancelled() => break,
            sent = output.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Terminal {terminal} pump stopped");
}

/// Feed queued client input into a slot's PTY until cancelled or the queue
/// closes. A write blocked on a controller that stopped reading is abandoned
/// as soon as the slot is cancelled.
pub async fn run_terminal_writer(
    terminal: u32,
    master: Arc<AsyncFd<File>>,
    mut input: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            () = cancel.cancelled() => break,
            data = input.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            written = crate::terminal::pty::write_all(&master, &data) => {
                if let Err(e) = written {
                    warn!("Terminal {terminal}: write failed: {e}");
                }
            }
        }
    }
    debug!("Terminal {terminal} writer stopped");
}

/// Forward backend WebSocket frames as `tunnel_data` until cancelled or the
/// backend closes. Receive errors end the worker silently.
pub async fn run_tunnel_pump<S>(
    mut backend: S,
    output: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = backend.next() => next,
        };
        let msg = match next {
            Some(Ok(Message::Text(text))) => ServerMessage::TunnelData {
                data: text.as_str().to_owned(),
                binary: false,
            },
            Some(Ok(Message::Binary(bytes))) => ServerMessage::TunnelData {
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                binary: true,
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Tunnel receive ended: {e}");
                break;
            }
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            sent = output.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
