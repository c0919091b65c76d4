//! Echo handler: one read-and-reply cycle per ready client socket.
//!
//! Each successful read of N bytes produces exactly one reply of
//! `"you sent: "` followed by those N bytes. There is no message framing;
//! chunk boundaries are whatever the read syscall returns.

use bytes::BytesMut;
use mio::net::TcpStream;
use std::io::{self, Read, Write};

/// Marker prepended to every echoed chunk.
pub const REPLY_MARKER: &[u8] = b"you sent: ";

/// Outcome of servicing one readiness event on a client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    /// A chunk of this many bytes was read and echoed back in full.
    Echoed(usize),
    /// The socket had no data after all (spurious or drained readiness).
    Idle,
    /// The peer performed an orderly shutdown; nothing was written.
    Closed,
}

/// Perform one read-and-echo cycle on a readable client socket.
///
/// `buf` bounds the chunk size. Read or write errors are returned to the
/// caller, which treats them the same as `Closed`.
pub fn serve_ready(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<EchoOutcome> {
    let n = loop {
        match stream.read(buf) {
            Ok(0) => return Ok(EchoOutcome::Closed),
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(EchoOutcome::Idle),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };

    let mut reply = BytesMut::with_capacity(REPLY_MARKER.len() + n);
    reply.extend_from_slice(REPLY_MARKER);
    reply.extend_from_slice(&buf[..n]);

    write_fully(stream, &reply)?;
    Ok(EchoOutcome::Echoed(n))
}

/// Write the whole reply, retrying short writes until complete.
///
/// A reply is at most marker + chunk size, so `WouldBlock` is retried
/// inline instead of carrying write-interest state across poll rounds.
fn write_fully(stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
