//! Framed TCP message channel.
//!
//! Wire format per frame: `[len: u32 LE][crc32c: u32 LE][body]` where the
//! body is one kind byte followed by the payload and `crc32c` covers the
//! body. Text frames carry the engine's JSON; ping/pong and close frames
//! belong to the transport and never reach a session. A close body is an
//! optional big-endian u16 code followed by a UTF-8 reason.
//!
//! Keepalive: with a ping interval configured, the reader thread pings on
//! schedule and declares the connection dead when nothing at all arrives
//! for the dead interval, surfacing `Closed` with code 1006.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, unbounded};

use crate::config::SyncConfig;

use super::channel::{ChannelEvent, ChannelHandle, ChannelSink};
use super::error::ChannelError;
use super::proto::{CLOSE_ABNORMAL, CLOSE_PROTOCOL_ERROR};

pub const FRAME_HEADER_LEN: usize = 8;

pub const FRAME_TEXT: u8 = 0;
pub const FRAME_PING: u8 = 1;
pub const FRAME_PONG: u8 = 2;
pub const FRAME_CLOSE: u8 = 3;

/// How long a blocked read waits before the reader thread runs its
/// keepalive bookkeeping.
const READ_TICK: Duration = Duration::from_millis(500);

/// Incremental frame parser over received bytes.
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has fully arrived.
    ///
    /// An oversized length is rejected from the header alone, before any of
    /// the body is buffered past the check.
    pub fn next_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, ChannelError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(ChannelError::InvalidFrame {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if len > self.max_frame_bytes {
            return Err(ChannelError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: len,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let expected = u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        let body: Vec<u8> = self
            .buf
            .drain(..FRAME_HEADER_LEN + len)
            .skip(FRAME_HEADER_LEN)
            .collect();
        let got = crc32c::crc32c(&body);
        if got != expected {
            return Err(ChannelError::CrcMismatch { expected, got });
        }
        let kind = body[0];
        Ok(Some((kind, body[1..].to_vec())))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, kind: u8, payload: &[u8]) -> Result<(), ChannelError> {
        let len = payload.len() + 1;
        if len > self.max_frame_bytes {
            return Err(ChannelError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: len,
            });
        }
        let mut body = Vec::with_capacity(len);
        body.push(kind);
        body.extend_from_slice(payload);
        let crc = crc32c::crc32c(&body);

        self.writer.write_all(&(len as u32).to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;
        Ok(())
    }
}

fn encode_close(code: Option<u16>, reason: Option<&str>) -> Vec<u8> {
    match code {
        None => Vec::new(),
        Some(code) => {
            let mut payload = code.to_be_bytes().to_vec();
            if let Some(reason) = reason {
                payload.extend_from_slice(reason.as_bytes());
            }
            payload
        }
    }
}

fn decode_close(payload: &[u8]) -> (Option<u16>, Option<String>) {
    if payload.len() < 2 {
        return (None, None);
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = if payload.len() > 2 {
        Some(String::from_utf8_lossy(&payload[2..]).into_owned())
    } else {
        None
    };
    (Some(code), reason)
}

struct TcpSink {
    writer: Mutex<FrameWriter<TcpStream>>,
    stream: TcpStream,
    events: Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl TcpSink {
    fn write(&self, kind: u8, payload: &[u8]) -> Result<(), ChannelError> {
        self.writer
            .lock()
            .expect("frame writer lock poisoned")
            .write_frame(kind, payload)
    }
}

impl ChannelSink for TcpSink {
    fn send(&self, text: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.write(FRAME_TEXT, text.as_bytes())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.write(FRAME_CLOSE, &encode_close(code, reason));
        let _ = self.events.send(ChannelEvent::Closed {
            code,
            reason: reason.map(str::to_string),
        });
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Open a client connection and frame it.
pub fn connect(
    addr: impl ToSocketAddrs,
    config: &SyncConfig,
) -> Result<ChannelHandle, ChannelError> {
    let stream = TcpStream::connect(addr)?;
    channel_over(stream, config)
}

/// Frame an accepted server-side connection.
pub fn accept(stream: TcpStream, config: &SyncConfig) -> Result<ChannelHandle, ChannelError> {
    channel_over(stream, config)
}

fn channel_over(stream: TcpStream, config: &SyncConfig) -> Result<ChannelHandle, ChannelError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_TICK))?;

    let (events_tx, events_rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    let writer_stream = stream.try_clone()?;
    let reader_stream = stream.try_clone()?;

    let sink = Arc::new(TcpSink {
        writer: Mutex::new(FrameWriter::new(writer_stream, config.max_frame_bytes)),
        stream,
        events: events_tx.clone(),
        closed: Arc::clone(&closed),
    });

    let reader = ReaderLoop {
        stream: reader_stream,
        buffer: FrameBuffer::new(config.max_frame_bytes),
        events: events_tx,
        sink: Arc::clone(&sink),
        closed,
        ping_interval: config.ping_interval(),
        dead_interval: config.dead_interval(),
    };
    thread::spawn(move || reader.run());

    Ok(ChannelHandle {
        events: events_rx,
        sink,
    })
}

struct ReaderLoop {
    stream: TcpStream,
    buffer: FrameBuffer,
    events: Sender<ChannelEvent>,
    sink: Arc<TcpSink>,
    closed: Arc<AtomicBool>,
    ping_interval: Option<Duration>,
    dead_interval: Duration,
}

impl ReaderLoop {
    fn run(mut self) {
        let mut chunk = [0u8; 8192];
        let mut last_rx = Instant::now();
        let mut last_ping = Instant::now();
        let mut ping_nonce: u64 = 0;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.terminate(None, None);
                    return;
                }
                Ok(n) => {
                    last_rx = Instant::now();
                    self.buffer.extend(&chunk[..n]);
                    loop {
                        match self.buffer.next_frame() {
                            Ok(Some((kind, payload))) => {
                                if !self.dispatch(kind, payload) {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(target: "sync", error = %err, "frame error");
                                let _ = self.events.send(ChannelEvent::Error(err));
                                self.terminate(Some(CLOSE_PROTOCOL_ERROR), Some("frame error"));
                                return;
                            }
                        }
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = self.events.send(ChannelEvent::Error(err.into()));
                    self.terminate(Some(CLOSE_ABNORMAL), Some("io error"));
                    return;
                }
            }

            if let Some(interval) = self.ping_interval {
                if last_rx.elapsed() > self.dead_interval {
                    self.terminate(Some(CLOSE_ABNORMAL), Some("keepalive timeout"));
                    return;
                }
                if last_ping.elapsed() >= interval {
                    last_ping = Instant::now();
                    ping_nonce = ping_nonce.wrapping_add(1);
                    if self.sink.write(FRAME_PING, &ping_nonce.to_le_bytes()).is_err() {
                        self.terminate(Some(CLOSE_ABNORMAL), Some("ping failed"));
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the connection is finished.
    fn dispatch(&mut self, kind: u8, payload: Vec<u8>) -> bool {
        match kind {
            FRAME_TEXT => match String::from_utf8(payload) {
                Ok(text) => {
                    let _ = self.events.send(ChannelEvent::Frame(text));
                    true
                }
                Err(_) => {
                    let _ = self.events.send(ChannelEvent::Error(ChannelError::NotText));
                    true
                }
            },
            FRAME_PING => {
                let _ = self.sink.write(FRAME_PONG, &payload);
                true
            }
            FRAME_PONG => true,
            FRAME_CLOSE => {
                let (code, reason) = decode_close(&payload);
                self.terminate(code, reason.as_deref());
                false
            }
            other => {
                let _ = self.events.send(ChannelEvent::Error(ChannelError::InvalidFrame {
                    reason: format!("unknown frame kind {other}"),
                }));
                true
            }
        }
    }

    /// Emit the terminal `Closed` exactly once and drop the socket.
    fn terminate(&self, code: Option<u16>, reason: Option<&str>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(ChannelEvent::Closed {
                code,
                reason: reason.map(str::to_string),
            });
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
