//! Length-prefixed message framing on top of a byte transport
//!
//! Every message is `len: u32 BE | bincode body`. The transport is either a
//! [`SecureSession`] or a [`PlainTransport`] around a raw socket; framing does
//! not care which. Bodies are encoded with a fixed bincode configuration
//! (varint integers, size limit, trailing bytes rejected) so both ends agree
//! on the exact layout.

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::error::{NetError, Result};
use crate::session::{is_would_block, SecureSession};

/// Upper bound on a single framed message body
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const FRAME_HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 4096;
/// Largest receive buffer: an incomplete frame plus one read
const RX_CAPACITY: usize = FRAME_HEADER_LEN + MAX_MESSAGE_SIZE + READ_CHUNK;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_SIZE as u64)
}

/// Serializes a message body with the wire codec
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(codec().serialize(message)?)
}

/// Deserializes a message body, rejecting trailing bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(codec().deserialize(bytes)?)
}

/// Byte-level transport under a [`FramedChannel`]
pub trait Transport {
    /// `Ok(None)` when no bytes are available yet
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Returns true when nothing is left queued
    fn flush(&mut self) -> Result<bool>;
}

impl<S: Read + Write> Transport for SecureSession<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        SecureSession::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        SecureSession::write(self, data)
    }

    fn flush(&mut self) -> Result<bool> {
        SecureSession::flush(self)
    }
}

/// Unencrypted transport over a raw stream, used for local tooling and tests
pub struct PlainTransport<S> {
    stream: S,
    tx_buf: Vec<u8>,
}

impl<S: Read + Write> PlainTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            tx_buf: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write> Transport for PlainTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            match self.stream.read(buf) {
                Ok(0) if !buf.is_empty() => return Err(NetError::Closed),
                Ok(n) => return Ok(Some(n)),
                Err(e) if is_would_block(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.tx_buf.extend_from_slice(data);
        self.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<bool> {
        while !self.tx_buf.is_empty() {
            match self.stream.write(&self.tx_buf) {
                Ok(0) => return Err(NetError::Closed),
                Ok(n) => {
                    self.tx_buf.drain(..n);
                }
                Err(e) if is_would_block(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Typed message stream: reads `In` messages, writes `Out` messages
pub struct FramedChannel<T, In, Out> {
    transport: T,
    rx: Zeroizing<Vec<u8>>,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<T: Transport, In: DeserializeOwned, Out: Serialize> FramedChannel<T, In, Out> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            rx: Zeroizing::new(Vec::with_capacity(RX_CAPACITY)),
            _marker: PhantomData,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Returns the next complete message, or `Ok(None)` if one has not fully
    /// arrived yet. Partial bytes are kept for the next call.
    pub fn read_message(&mut self) -> Result<Option<In>> {
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(Some(message));
            }

            let mut chunk = Zeroizing::new([0u8; READ_CHUNK]);
            match self.transport.read(&mut chunk[..])? {
                Some(0) => return Err(NetError::Closed),
                Some(n) => self.rx.extend_from_slice(&chunk[..n]),
                None => return Ok(None),
            }
        }
    }

    /// Like [`read_message`](Self::read_message) for blocking transports,
    /// where "nothing yet" can only mean the read timeout expired
    pub fn expect_message(&mut self) -> Result<In> {
        self.read_message()?
            .ok_or_else(|| io::Error::from(io::ErrorKind::TimedOut).into())
    }

    pub fn write_message(&mut self, message: &Out) -> Result<()> {
        let body = Zeroizing::new(encode(message)?);
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::TooLarge {
                size: body.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }

        let mut frame = Zeroizing::new(Vec::with_capacity(FRAME_HEADER_LEN + body.len()));
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        self.transport.write(&frame)
    }

    pub fn flush(&mut self) -> Result<bool> {
        self.transport.flush()
    }

    fn try_decode(&mut self) -> Result<Option<In>> {
        if self.rx.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.rx[0], self.rx[1], self.rx[2], self.rx[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::TooLarge {
                size: len,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        if self.rx.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let message = decode(&self.rx[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len]);
        self.rx.drain(..FRAME_HEADER_LEN + len);
        message.map(Some)
    }
}

impl<T, In, Out> std::fmt::Debug for FramedChannel<T, In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("buffered", &self.rx.len())
            .finish_non_exhaustive()
    }
}
