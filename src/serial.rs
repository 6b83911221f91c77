// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd};
use serialport::{SerialPort as SerialPortTrait, DataBits, StopBits};
use thiserror::Error;

/// Baud rate used to open the device before the real mode is applied
const OPEN_BAUD_RATE: u32 = 9600;

/// Longest time a read or write stays inside the driver before the closed
/// flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum PortError {
    #[error("failed to open device {device:?}: {source}")]
    Open {
        device: String,
        #[source]
        source: serialport::Error,
    },

    #[error("unsupported data bits: {0}. Must be 5, 6, 7, or 8")]
    UnsupportedDataBits(u8),

    #[error("unsupported stop bits: {0}. Must be 1 or 2")]
    UnsupportedStopBits(u8),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("failed to configure device: {0}")]
    Io(#[from] io::Error),

    #[error("serial port closed")]
    Closed,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, PortError::Closed)
}

// ============================================================================
// Mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    /// Maps a parity selector (`N`, `O`, `E`) to a parity. Anything that is
    /// not exactly `O` or `E` means no parity.
    pub fn from_selector(selector: &str) -> Parity {
        match selector {
            "O" => Parity::Odd,
            "E" => Parity::Even,
            _ => Parity::None,
        }
    }

    fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

/// Line settings applied to a port before any data is exchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} baud, {}{}{}", self.baud_rate, self.data_bits, self.parity.letter(), self.stop_bits)
    }
}

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Duplex byte channel the uploader talks to.
///
/// Every operation takes `&self` so one port can be shared between the
/// uploader and whoever may need to close it. `close` must make any read or
/// write pending on another thread return an error promptly.
pub trait SerialPort: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn close(&self) -> Result<(), PortError>;

    fn set_mode(&self, mode: &Mode) -> Result<(), PortError>;
}

/// `std::io` view of a shared port, for buffered readers and `io::copy`
pub struct PortIo {
    port: Arc<dyn SerialPort>,
}

impl PortIo {
    pub fn new(port: Arc<dyn SerialPort>) -> Self {
        PortIo { port }
    }
}

impl Read for PortIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for PortIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Mutex<Option<Box<dyn SerialPortTrait>>>,
    closed: AtomicBool,
}

impl RealSerialPort {
    #[cfg(unix)]
    pub fn open(device: &str) -> Result<Self, PortError> {
        let port = serialport::new(device, OPEN_BAUD_RATE)
            .timeout(POLL_INTERVAL)
            .open_native()
            .map_err(|source| PortError::Open {
                device: device.to_string(),
                source,
            })?;

        RealSerialPort::from_tty(port)
    }

    #[cfg(not(unix))]
    pub fn open(device: &str) -> Result<Self, PortError> {
        let port = serialport::new(device, OPEN_BAUD_RATE)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|source| PortError::Open {
                device: device.to_string(),
                source,
            })?;

        Ok(RealSerialPort::from_port(port))
    }

    /// Wraps an open tty. The descriptor is switched to non-blocking so a
    /// write to a stalled line gives up after one poll interval instead of
    /// sleeping in the kernel.
    #[cfg(unix)]
    pub fn from_tty(port: serialport::TTYPort) -> Result<Self, PortError> {
        set_nonblocking(&port)?;
        Ok(RealSerialPort::from_port(Box::new(port)))
    }

    fn from_port(port: Box<dyn SerialPortTrait>) -> Self {
        RealSerialPort {
            port: Mutex::new(Some(port)),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Reads and writes give up after one poll interval, so the lock is never
    // held longer than that.
    fn with_port<T>(&self, f: impl FnOnce(&mut dyn SerialPortTrait) -> io::Result<T>) -> io::Result<T> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(port) => f(&mut **port),
            None => Err(closed_error()),
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(port: &serialport::TTYPort) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    // SAFETY: `port` owns the descriptor and outlives this borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(port.as_raw_fd()) };
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

// A full output queue shows up as a poll timeout or, on a non-blocking
// descriptor, as WouldBlock. Either way the closed flag is checked again.
fn is_retry(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

fn data_bits(bits: u8) -> Result<DataBits, PortError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(PortError::UnsupportedDataBits(bits)),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits, PortError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(PortError::UnsupportedStopBits(bits)),
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

impl SerialPort for RealSerialPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.with_port(|port| port.read(buf)) {
                Err(e) if is_retry(&e) => continue,
                result => return result,
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.with_port(|port| port.write(buf)) {
                Err(e) if is_retry(&e) => continue,
                result => return result,
            }
        }
    }

    fn close(&self) -> Result<(), PortError> {
        self.closed.store(true, Ordering::Release);
        let port = self.port.lock().unwrap_or_else(PoisonError::into_inner).take();
        // Released outside the lock; the driver may still drain queued output.
        drop(port);
        Ok(())
    }

    fn set_mode(&self, mode: &Mode) -> Result<(), PortError> {
        let data_bits = data_bits(mode.data_bits)?;
        let stop_bits = stop_bits(mode.stop_bits)?;

        if self.is_closed() {
            return Err(PortError::Closed);
        }
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = guard.as_mut().ok_or(PortError::Closed)?;
        port.set_baud_rate(mode.baud_rate)?;
        port.set_data_bits(data_bits)?;
        port.set_stop_bits(stop_bits)?;
        port.set_parity(parity(mode.parity))?;
        Ok(())
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub use mock::MockSerialPort;

#[cfg(test)]
mod mock {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Condvar, Mutex, MutexGuard};

    use super::{closed_error, Mode, PortError, SerialPort};

    #[derive(Default)]
    struct MockState {
        // Chunks handed out by successive reads
        reads: VecDeque<Vec<u8>>,
        // Block instead of reporting EOF once `reads` runs dry
        hold_open: bool,
        block_writes: bool,
        fail_writes: bool,
        reject_mode: bool,
        written: Vec<u8>,
        modes: Vec<Mode>,
        reads_before_mode: usize,
        closed: bool,
    }

    /// Scripted in-memory port. Reads hand out the queued chunks and then
    /// report EOF, or block until `close` when held open.
    #[derive(Default)]
    pub struct MockSerialPort {
        state: Mutex<MockState>,
        wakeup: Condvar,
    }

    impl MockSerialPort {
        pub fn new<I>(reads: I) -> Self
        where
            I: IntoIterator,
            I::Item: AsRef<[u8]>,
        {
            let port = MockSerialPort::default();
            port.lock().reads = reads.into_iter().map(|chunk| chunk.as_ref().to_vec()).collect();
            port
        }

        pub fn hold_open(self) -> Self {
            self.lock().hold_open = true;
            self
        }

        pub fn block_writes(self) -> Self {
            self.lock().block_writes = true;
            self
        }

        pub fn fail_writes(self) -> Self {
            self.lock().fail_writes = true;
            self
        }

        pub fn reject_mode(self) -> Self {
            self.lock().reject_mode = true;
            self
        }

        pub fn written(&self) -> Vec<u8> {
            self.lock().written.clone()
        }

        pub fn modes(&self) -> Vec<Mode> {
            self.lock().modes.clone()
        }

        pub fn reads_before_mode(&self) -> usize {
            self.lock().reads_before_mode
        }

        fn lock(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }
    }

    impl SerialPort for MockSerialPort {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.lock();
            if state.modes.is_empty() {
                state.reads_before_mode += 1;
            }
            loop {
                if state.closed {
                    return Err(closed_error());
                }
                if let Some(chunk) = state.reads.front_mut() {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        state.reads.pop_front();
                    }
                    return Ok(n);
                }
                if !state.hold_open {
                    return Ok(0);
                }
                state = self.wakeup.wait(state).unwrap();
            }
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.lock();
            while state.block_writes && !state.closed {
                state = self.wakeup.wait(state).unwrap();
            }
            if state.closed {
                return Err(closed_error());
            }
            if state.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Mock write failure"));
            }
            state.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&self) -> Result<(), PortError> {
            self.lock().closed = true;
            self.wakeup.notify_all();
            Ok(())
        }

        fn set_mode(&self, mode: &Mode) -> Result<(), PortError> {
            let mut state = self.lock();
            if state.reject_mode {
                return Err(PortError::UnsupportedStopBits(mode.stop_bits));
            }
            state.modes.push(*mode);
            Ok(())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(all(test, unix))]
mod tty_tests {
    use super::*;
    use serialport::TTYPort;
    use std::sync::mpsc;
    use std::time::Instant;

    fn open_pair() -> (TTYPort, Arc<RealSerialPort>) {
        let (master, slave) = TTYPort::pair().expect("Unable to create pseudo-terminal pair");
        let port = RealSerialPort::from_tty(slave).expect("Unable to wrap pseudo-terminal");
        (master, Arc::new(port))
    }

    fn read_exact_from(master: &mut TTYPort, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < len && Instant::now() < deadline {
            match master.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => panic!("failed to read from pty: {}", e),
            }
        }
        received
    }

    #[test]
    fn test_set_mode() {
        let (_master, port) = open_pair();
        let mode = Mode {
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::Even,
        };
        port.set_mode(&mode).unwrap();

        let bad = Mode { stop_bits: 3, ..mode };
        assert!(matches!(port.set_mode(&bad), Err(PortError::UnsupportedStopBits(3))));

        port.close().unwrap();
        assert!(matches!(port.set_mode(&mode), Err(PortError::Closed)));
    }

    #[test]
    fn test_read_write() {
        let (mut master, port) = open_pair();

        PortIo::new(port.clone()).write_all(b"ping").unwrap();
        assert_eq!(read_exact_from(&mut master, 4), b"ping");

        master.write_all(b"pong").unwrap();
        let mut buf = [0u8; 4];
        PortIo::new(port.clone()).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_close_unblocks_read() {
        let (_master, port) = open_pair();
        let reader = port.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            tx.send(reader.read(&mut buf)).ok();
        });

        std::thread::sleep(Duration::from_millis(200));
        port.close().unwrap();

        let result = rx.recv_timeout(Duration::from_secs(3)).expect("read did not return after close");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_close_unblocks_stalled_write() {
        // Nobody reads the master side, so the pty buffer fills up and stays full.
        let (_master, port) = open_pair();
        let writer = port.clone();
        let (write_tx, write_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let data = vec![b'x'; 1024 * 1024];
            write_tx.send(PortIo::new(writer).write_all(&data)).ok();
        });

        std::thread::sleep(Duration::from_millis(500));
        let closer = port.clone();
        let (close_tx, close_rx) = mpsc::channel();
        std::thread::spawn(move || {
            close_tx.send(closer.close()).ok();
        });

        close_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("close blocked behind a stalled write")
            .unwrap();
        let result = write_rx.recv_timeout(Duration::from_secs(3)).expect("write did not return after close");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
