//! Wire framing and the per-connection broker.
//!
//! Frames are `[4-byte magic][4-byte length][msgpack body]`; the body holds
//! one or more `[method_name, payload]` message pairs back to back. The
//! length is host byte order — both ends of this channel always share a
//! machine.
//!
//! The receive path applies the timeout policy from the session contract:
//! the header wait is bounded only while a connection is bootstrapping,
//! the body read is always bounded, and a body that exceeds the configured
//! cap is drained and reported without desynchronizing the stream.

pub mod value;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::BytesMut;
use rmpv::Value;
use thiserror::Error;
use tracing::trace;

use crate::config::RuntimeConfig;

pub use value::{DecodeError, DecodeLimits, Decoder};

/// Frame magic: protocol tag plus a NUL version byte.
pub const MAGIC: [u8; 4] = *b"ddX\0";

/// Fixed frame header length (magic + body length).
pub const HEADER_LEN: usize = 8;

/// Scratch size used when draining an oversized body.
const DRAIN_CHUNK: usize = 8 * 1024;

/// Receive-path failures.
///
/// The variants split into two classes: recoverable ones (the stream is
/// still framed correctly, the session answers with the error sentinel and
/// keeps serving) and fatal ones (the transport is gone or suspect).
#[derive(Debug, Error)]
pub enum RecvError {
    /// Peer closed the connection at a frame boundary.
    #[error("client disconnected")]
    Disconnected,

    /// Peer closed or stalled mid-header. The stream cannot be re-synced.
    #[error("short header read")]
    ShortHeader,

    /// First four bytes were not the protocol magic.
    #[error("bad frame magic")]
    BadMagic,

    /// No header arrived within the bootstrap window.
    #[error("timed out waiting for a frame header")]
    Timeout,

    /// Peer closed or stalled mid-body after declaring a length.
    #[error("short body read")]
    ShortBody,

    /// Declared body length exceeds the cap. The body has already been
    /// drained; the stream is still usable.
    #[error("body of {len} bytes exceeds cap of {max}")]
    BodyTooLarge { len: usize, max: usize },

    /// Body bytes arrived but did not decode within limits.
    #[error("undecodable body: {0}")]
    Decode(#[from] DecodeError),

    /// A frame with a zero-length body carries no message.
    #[error("empty frame body")]
    EmptyBody,

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecvError {
    /// Whether the session may keep serving this connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RecvError::BodyTooLarge { .. } | RecvError::Decode(_) | RecvError::EmptyBody
        )
    }
}

/// Send-path failure. Always fatal to the session: a peer that cannot
/// take our response cannot be answered about it either.
#[derive(Debug, Error)]
#[error("cannot send response: {0}")]
pub struct SendError(#[from] pub std::io::Error);

/// Encode messages into a single framed byte buffer.
pub fn frame_bytes(messages: &[(&str, &Value)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, payload) in messages {
        let message = Value::Array(vec![Value::from(*name), (*payload).clone()]);
        value::encode_into(&mut body, &message);
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_ne_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Framed transport endpoint for one connection.
pub struct Broker {
    stream: UnixStream,
    max_body: usize,
    limits: DecodeLimits,
    body_timeout: Duration,
}

impl Broker {
    pub fn new(stream: UnixStream, config: &RuntimeConfig) -> Self {
        Self {
            stream,
            max_body: config.max_body_bytes,
            limits: DecodeLimits::default(),
            body_timeout: config.body_recv_timeout,
        }
    }

    /// Receive one frame and decode every message in its body.
    ///
    /// `header_timeout` bounds the wait for the first header byte; `None`
    /// blocks until data arrives or the peer disconnects.
    pub fn recv(&mut self, header_timeout: Option<Duration>) -> Result<Vec<Value>, RecvError> {
        let header = self.read_header(header_timeout)?;

        if header[..4] != MAGIC {
            return Err(RecvError::BadMagic);
        }
        let len = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
        trace!(body_len = len, "frame header received");

        if len == 0 {
            return Err(RecvError::EmptyBody);
        }
        if len > self.max_body {
            self.drain_body(len)?;
            return Err(RecvError::BodyTooLarge {
                len,
                max: self.max_body,
            });
        }

        let body = self.read_body(len)?;
        let mut decoder = Decoder::new(&body, self.limits);
        let mut messages = Vec::new();
        while !decoder.is_empty() {
            messages.push(decoder.read_value()?);
        }
        Ok(messages)
    }

    /// Send one or more `[name, payload]` messages behind a single frame.
    pub fn send(&mut self, messages: &[(&str, &Value)]) -> Result<(), SendError> {
        let frame = frame_bytes(messages);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_header(&mut self, timeout: Option<Duration>) -> Result<[u8; HEADER_LEN], RecvError> {
        self.stream.set_read_timeout(timeout)?;

        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0usize;
        while filled < HEADER_LEN {
            match self.stream.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Err(RecvError::Disconnected),
                Ok(0) => return Err(RecvError::ShortHeader),
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) && filled == 0 => return Err(RecvError::Timeout),
                Err(e) if is_timeout(&e) => return Err(RecvError::ShortHeader),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RecvError::Io(e)),
            }
        }
        Ok(header)
    }

    fn read_body(&mut self, len: usize) -> Result<BytesMut, RecvError> {
        self.stream.set_read_timeout(Some(self.body_timeout))?;

        let mut body = BytesMut::zeroed(len);
        let mut filled = 0usize;
        while filled < len {
            match self.stream.read(&mut body[filled..]) {
                Ok(0) => return Err(RecvError::ShortBody),
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => return Err(RecvError::ShortBody),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RecvError::Io(e)),
            }
        }
        Ok(body)
    }

    /// Discard exactly `len` declared body bytes so the next frame starts
    /// at a clean boundary.
    fn drain_body(&mut self, len: usize) -> Result<(), RecvError> {
        self.stream.set_read_timeout(Some(self.body_timeout))?;

        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(DRAIN_CHUNK);
            match self.stream.read(&mut scratch[..want]) {
                Ok(0) => return Err(RecvError::ShortBody),
                Ok(n) => remaining -= n,
                Err(e) if is_timeout(&e) => return Err(RecvError::ShortBody),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RecvError::Io(e)),
            }
        }
        Ok(())
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Broker, UnixStream) {
        let (server, client) = UnixStream::pair().expect("socketpair");
        (Broker::new(server, &RuntimeConfig::default()), client)
    }

    fn small_pair(max_body: usize) -> (Broker, UnixStream) {
        let (server, client) = UnixStream::pair().expect("socketpair");
        let config = RuntimeConfig {
            max_body_bytes: max_body,
            ..RuntimeConfig::default()
        };
        (Broker::new(server, &config), client)
    }

    #[test]
    fn receives_a_framed_message() {
        let (mut broker, mut client) = pair();
        let payload = Value::Map(vec![(Value::from("k"), Value::from("v"))]);
        client
            .write_all(&frame_bytes(&[("request_init", &payload)]))
            .expect("write");

        let messages = broker.recv(None).expect("recv");
        assert_eq!(messages.len(), 1);
        let parts = messages[0].as_array().expect("pair");
        assert_eq!(parts[0].as_str(), Some("request_init"));
        assert_eq!(parts[1], payload);
    }

    #[test]
    fn receives_multiple_messages_in_one_frame() {
        let (mut broker, mut client) = pair();
        let a = Value::from(1u64);
        let b = Value::from(2u64);
        client
            .write_all(&frame_bytes(&[("first", &a), ("second", &b)]))
            .expect("write");

        let messages = broker.recv(None).expect("recv");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn disconnect_at_boundary_is_clean() {
        let (mut broker, client) = pair();
        drop(client);
        assert!(matches!(broker.recv(None), Err(RecvError::Disconnected)));
    }

    #[test]
    fn partial_header_is_corruption() {
        let (mut broker, mut client) = pair();
        client.write_all(b"ddX").expect("write");
        drop(client);
        assert!(matches!(broker.recv(None), Err(RecvError::ShortHeader)));
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let (mut broker, mut client) = pair();
        client.write_all(b"nope\x04\x00\x00\x00zzzz").expect("write");
        assert!(matches!(broker.recv(None), Err(RecvError::BadMagic)));
    }

    #[test]
    fn bootstrap_window_expires() {
        let (mut broker, _client) = pair();
        let err = broker
            .recv(Some(Duration::from_millis(50)))
            .expect_err("no data");
        assert!(matches!(err, RecvError::Timeout));
    }

    #[test]
    fn oversized_body_is_drained_and_recoverable() {
        let (mut broker, mut client) = small_pair(64);
        let big = Value::from("x".repeat(600));
        client
            .write_all(&frame_bytes(&[("request_init", &big)]))
            .expect("write");
        // Follow-up frame queued behind the oversized one.
        client
            .write_all(&frame_bytes(&[("config_sync", &Value::Nil)]))
            .expect("write");

        let err = broker.recv(None).expect_err("too large");
        assert!(err.is_recoverable());
        assert!(matches!(err, RecvError::BodyTooLarge { .. }));

        // The stream is still aligned on the next frame.
        let messages = broker.recv(None).expect("next frame");
        let parts = messages[0].as_array().expect("pair");
        assert_eq!(parts[0].as_str(), Some("config_sync"));
    }

    #[test]
    fn body_stall_is_fatal() {
        let (mut broker, mut client) = pair();
        // Header promising 32 bytes, body never sent.
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&32u32.to_ne_bytes());
        client.write_all(&frame).expect("write");

        let err = broker.recv(None).expect_err("stalled body");
        assert!(matches!(err, RecvError::ShortBody));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn undecodable_body_is_recoverable() {
        let (mut broker, mut client) = pair();
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&1u32.to_ne_bytes());
        frame.push(0xc1); // reserved marker
        client.write_all(&frame).expect("write");

        let err = broker.recv(None).expect_err("bad body");
        assert!(err.is_recoverable());
    }
}
