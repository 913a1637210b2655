//! Scripted in-memory port for protocol tests.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::slip;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

/// A modem control line change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    Dtr(bool),
    Rts(bool),
}

/// Port that replays queued device output and records host traffic.
///
/// Each queued chunk is returned by one `read` call. When the queue is empty
/// reads time out.
pub(crate) struct MockPort {
    reads: VecDeque<Vec<u8>>,
    pub(crate) written: Vec<u8>,
    pub(crate) lines: Vec<Line>,
    pub(crate) timeouts: Vec<Duration>,
    pub(crate) waiting: u32,
    pub(crate) pid: Option<u16>,
    timeout: Duration,
    baud_rate: u32,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            written: Vec::new(),
            lines: Vec::new(),
            timeouts: Vec::new(),
            waiting: 0,
            pid: None,
            timeout: Duration::from_secs(3),
            baud_rate: 115200,
        }
    }

    /// Queue raw bytes as one read.
    pub(crate) fn push_raw(&mut self, bytes: &[u8]) {
        self.reads
            .push_back(bytes.to_vec());
    }

    /// Queue one SLIP frame.
    pub(crate) fn push_frame(&mut self, payload: &[u8]) {
        self.push_raw(&slip::encode(payload));
    }

    /// Queue a response frame with the given body.
    pub(crate) fn push_response(&mut self, opcode: u8, value: u32, body: &[u8]) {
        let mut frame = vec![0x01, opcode];
        frame
            .write_u16::<LittleEndian>(body.len() as u16)
            .unwrap();
        frame
            .write_u32::<LittleEndian>(value)
            .unwrap();
        frame.extend_from_slice(body);
        self.push_frame(&frame);
    }

    /// Queue a successful response with `status_len` zero status bytes.
    pub(crate) fn push_ok(&mut self, opcode: u8, value: u32, status_len: usize) {
        self.push_response(opcode, value, &vec![0; status_len]);
    }

    /// Number of queued reads not yet consumed.
    pub(crate) fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    /// Decode everything the host wrote into frames.
    pub(crate) fn sent_frames(&self) -> Vec<Vec<u8>> {
        slip::decode(&self.written).unwrap()
    }

    /// Opcodes of every command the host wrote.
    pub(crate) fn sent_opcodes(&self) -> Vec<u8> {
        self.sent_frames()
            .iter()
            .map(|f| f[1])
            .collect()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.reads.pop_front() else {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock timeout"));
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.reads.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeouts.push(timeout);
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    // Queued bytes stand for future device output, so nothing is dropped.
    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push(Line::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lines.push(Line::Rts(level));
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.waiting)
    }

    fn usb_pid(&self) -> Option<u16> {
        self.pid
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
