//! Client side of the SASL handshake that precedes the binary stream.
//!
//! The dialog is line based: `AUTH EXTERNAL` with the hex-encoded uid,
//! then descriptor-passing negotiation, then `BEGIN`. The server speaks
//! exactly one line per client command, so a plain read loop is enough.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use log::*;

use ferrobus_common::errors::{Error, Result};

/// Authenticate on a freshly connected socket. Returns whether the server
/// agreed to pass unix descriptors. The caller sets the socket timeout.
pub(crate) fn authenticate(stream: &mut UnixStream) -> Result<bool> {
    let uid = unsafe { libc::getuid() };
    let uid_hex: String = uid
        .to_string()
        .bytes()
        .map(|b| format!("{b:02x}"))
        .collect();

    // the leading NUL is the credentials byte of the transport
    send_line(stream, &format!("\0AUTH EXTERNAL {uid_hex}"))?;

    let reply = read_line(stream)?;
    if !reply.starts_with("OK ") {
        return Err(Error::ConnectionFailed(format!(
            "authentication rejected: {reply}"
        )));
    }

    send_line(stream, "NEGOTIATE_UNIX_FD")?;
    let reply = read_line(stream)?;
    let fd_passing = reply == "AGREE_UNIX_FD";
    if !fd_passing {
        debug!("Server refused descriptor passing: {reply}");
    }

    send_line(stream, "BEGIN")?;

    Ok(fd_passing)
}

fn send_line(stream: &mut UnixStream, line: &str) -> Result<()> {
    stream
        .write_all(format!("{line}\r\n").as_bytes())
        .map_err(|e| Error::ConnectionFailed(format!("authentication write failed: {e}")))
}

fn read_line(stream: &mut UnixStream) -> Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        let n = stream
            .read(&mut byte)
            .map_err(|e| Error::ConnectionFailed(format!("authentication read failed: {e}")))?;
        if n == 0 {
            return Err(Error::ConnectionFailed(
                "server closed the connection during authentication".into(),
            ));
        }

        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).map_err(|_| {
                Error::ConnectionFailed("authentication reply is not valid UTF-8".into())
            });
        }

        if line.len() > 4096 {
            return Err(Error::ConnectionFailed(
                "authentication reply line too long".into(),
            ));
        }

        line.push(byte[0]);
    }
}
