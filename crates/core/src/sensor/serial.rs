use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, SerialPort};

use super::LineTransport;
use crate::{Result, StepSyncError};

const READ_CHUNK: usize = 1024;
const POLL_SLEEP: Duration = Duration::from_millis(1);
const MAX_PENDING_LINES: usize = 4096;

/// Line-oriented transport over a real serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    rx_buf: Vec<u8>,
    lines: VecDeque<String>,
}

impl SerialTransport {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let serial = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|err| StepSyncError::Transport {
                port: port.to_string(),
                source: io::Error::from(err),
            })?;
        tracing::info!(port, baud_rate, "serial port opened");

        Ok(Self {
            port: serial,
            name: port.to_string(),
            rx_buf: Vec::with_capacity(READ_CHUNK),
            lines: VecDeque::new(),
        })
    }

    /// Names of the serial ports visible on this machine.
    pub fn list_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        Ok(ports.into_iter().map(|port| port.port_name).collect())
    }

    /// Moves whatever bytes are already buffered by the driver into `lines`
    /// without blocking.
    fn poll_once(&mut self) -> io::Result<()> {
        let available = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if available == 0 {
            return Ok(());
        }

        let mut chunk = [0u8; READ_CHUNK];
        let mut remaining = available;
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK);
            match self.port.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    self.rx_buf.extend_from_slice(&chunk[..n]);
                    remaining = remaining.saturating_sub(n);
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        self.extract_lines();
        Ok(())
    }

    fn extract_lines(&mut self) {
        while let Some(pos) = self.rx_buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.rx_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            self.lines.push_back(line);
            while self.lines.len() > MAX_PENDING_LINES {
                self.lines.pop_front();
            }
        }
    }
}

impl LineTransport for SerialTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            self.poll_once()?;
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_SLEEP);
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)?;
        self.rx_buf.clear();
        self.lines.clear();
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("pending_lines", &self.lines.len())
            .finish()
    }
}
