//! SLIP packet framing.
//!
//! Every command and response on the wire is wrapped in a SLIP frame:
//!
//! ```text
//! +------+---------------------------------+------+
//! | 0xC0 | payload (0xC0/0xDB escaped)     | 0xC0 |
//! +------+---------------------------------+------+
//!
//! 0xC0 inside the payload -> 0xDB 0xDC
//! 0xDB inside the payload -> 0xDB 0xDD
//! ```
//!
//! Decoding is a three-state machine ([`DecodeState`]). [`SlipReader`] drives
//! it from a byte stream, pulling everything the driver has buffered on each
//! read rather than one byte per syscall.

use crate::error::{Error, FramingError, Result};
use log::trace;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};

/// Frame delimiter.
pub const END: u8 = 0xC0;

/// Escape introducer.
pub const ESC: u8 = 0xDB;

/// Escaped form of [`END`].
pub const ESC_END: u8 = 0xDC;

/// Escaped form of [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

/// Size of the scratch buffer used for each driver read.
const READ_CHUNK: usize = 4096;

/// Wrap `payload` in delimiters, escaping reserved bytes.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &b in payload {
        match b {
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            END => out.extend_from_slice(&[ESC, ESC_END]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Decode a complete byte buffer into the frames it contains.
///
/// Trailing bytes of an unfinished frame are reported as
/// [`FramingError::TransferStopped`].
pub fn decode(bytes: &[u8]) -> std::result::Result<Vec<Vec<u8>>, FramingError> {
    let mut decoder = SlipDecoder::new();
    let mut frames = Vec::new();
    for &b in bytes {
        if let Some(frame) = decoder.feed(b)? {
            frames.push(frame);
        }
    }
    if decoder.state != DecodeState::AwaitingStart {
        return Err(FramingError::TransferStopped(decoder.partial.len()));
    }
    Ok(frames)
}

/// Position of the decoder relative to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Between frames; only a delimiter is acceptable.
    AwaitingStart,
    /// Collecting payload bytes.
    InPacket,
    /// The previous byte was [`ESC`].
    InEscape,
}

/// Byte-at-a-time SLIP decoder.
#[derive(Debug)]
pub struct SlipDecoder {
    state: DecodeState,
    partial: Vec<u8>,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    /// Create a decoder waiting for the first delimiter.
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingStart,
            partial: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Number of payload bytes collected for the frame in progress.
    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    /// Drop any frame in progress.
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingStart;
        self.partial.clear();
    }

    /// Push one byte, returning a payload when it completes a frame.
    ///
    /// On error the decoder is reset and can be fed again.
    pub fn feed(&mut self, b: u8) -> std::result::Result<Option<Vec<u8>>, FramingError> {
        match self.state {
            DecodeState::AwaitingStart => {
                if b != END {
                    return Err(FramingError::InvalidHead(b));
                }
                self.state = DecodeState::InPacket;
                Ok(None)
            },
            DecodeState::InPacket => match b {
                END => {
                    self.state = DecodeState::AwaitingStart;
                    Ok(Some(std::mem::take(&mut self.partial)))
                },
                ESC => {
                    self.state = DecodeState::InEscape;
                    Ok(None)
                },
                _ => {
                    self.partial.push(b);
                    Ok(None)
                },
            },
            DecodeState::InEscape => {
                let decoded = match b {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    _ => {
                        self.reset();
                        return Err(FramingError::InvalidEscape(b));
                    },
                };
                self.partial.push(decoded);
                self.state = DecodeState::InPacket;
                Ok(None)
            },
        }
    }
}

/// Pulls SLIP frames out of a byte stream.
///
/// Bytes read past the end of one frame are kept for the next call, so a
/// single driver read carrying several responses loses nothing.
#[derive(Debug, Default)]
pub struct SlipReader {
    decoder: SlipDecoder,
    pending: VecDeque<u8>,
    seen_frame: bool,
}

impl SlipReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget buffered bytes and any frame in progress.
    pub fn reset(&mut self) {
        self.decoder
            .reset();
        self.pending
            .clear();
    }

    /// Read the next complete frame.
    ///
    /// A read that returns no data (timeout) is fatal for this call. The
    /// error distinguishes a link that never spoke, one that went quiet
    /// between frames, and one that stopped mid-frame.
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Vec<u8>> {
        loop {
            while let Some(b) = self.pending.pop_front() {
                match self.decoder.feed(b) {
                    Ok(Some(frame)) => {
                        trace!("Received full packet: {}", hex(&frame));
                        self.seen_frame = true;
                        return Ok(frame);
                    },
                    Ok(None) => {},
                    Err(e) => {
                        trace!(
                            "Framing error, dropping {} buffered bytes",
                            self.pending.len()
                        );
                        self.reset();
                        return Err(e.into());
                    },
                }
            }

            let mut buf = [0u8; READ_CHUNK];
            let n = match reader.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::TimedOut => 0,
                Err(e) => return Err(Error::Io(e)),
            };
            if n == 0 {
                return Err(self.stop_error().into());
            }
            trace!("Read {n} bytes: {}", hex(&buf[..n]));
            self.pending
                .extend(&buf[..n]);
        }
    }

    /// Endless iterator over frames read from `reader`.
    ///
    /// Errors are yielded in place; the iterator keeps going afterwards.
    pub fn frames<'a, R: Read + ?Sized>(&'a mut self, reader: &'a mut R) -> Frames<'a, R> {
        Frames {
            slip: self,
            reader,
        }
    }

    fn stop_error(&mut self) -> FramingError {
        let err = match self.decoder.state() {
            DecodeState::AwaitingStart if self.seen_frame => FramingError::StreamStopped,
            DecodeState::AwaitingStart => FramingError::NoData,
            _ => FramingError::TransferStopped(
                self.decoder
                    .partial_len(),
            ),
        };
        self.decoder
            .reset();
        err
    }
}

/// Iterator returned by [`SlipReader::frames`].
pub struct Frames<'a, R: Read + ?Sized> {
    slip: &'a mut SlipReader,
    reader: &'a mut R,
}

impl<R: Read + ?Sized> Iterator for Frames<'_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(
            self.slip
                .read_frame(self.reader),
        )
    }
}

pub(crate) fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
