//!
//! net.rs
//! Small blocking-I/O helpers shared by every peer/master connection.
//! Centralizes the three-way read outcome (value, deadline, peer-closed):
//! a timeout and a closed connection are different diagnostics even
//! though both trigger the same election/abort branch in the caller.
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::Result;

/// The outcome of one bounded read of a line from a peer or master
/// connection.
pub enum ReadOutcome {
    Line(String),
    Timeout,
    Closed,
}

/// Reads a single newline-terminated line from `stream`, bounded by
/// `deadline`. Distinguishes a timed-out read from a cleanly closed
/// connection; both are non-fatal to the caller but drive different log
/// messages and, in the participant/coordinator paths, different retries.
pub fn read_line_with_deadline(stream: &mut TcpStream, deadline: Duration) -> ReadOutcome {
    if stream.set_read_timeout(Some(deadline)).is_err() {
        return ReadOutcome::Closed;
    }
    let mut reader = BufReader::new(&*stream);
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => ReadOutcome::Closed,
        Ok(_) => ReadOutcome::Line(line),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
            ReadOutcome::Timeout
        }
        Err(_) => ReadOutcome::Closed,
    }
}

/// Connects to `addr` bounded by `timeout`.
pub fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let socket = addr.parse().map_err(|_| {
        crate::error::Error::MalformedMessage(format!("bad peer address: {}", addr))
    })?;
    Ok(TcpStream::connect_timeout(&socket, timeout)?)
}

/// Writes `line` (expected to already be newline-terminated) to `stream`.
pub fn send_line(stream: &mut TcpStream, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes())?;
    Ok(())
}
