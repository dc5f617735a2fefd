//! The low-level transport: one authenticated unix socket, an outbound
//! frame queue with serial assignment, and inbound frame reassembly.
//!
//! The channel itself never schedules anything. It publishes its fd and
//! current interest; the executor (see [`crate::reactor`]) watches
//! readiness and calls back in. Before an executor is installed the
//! blocking helpers pump the socket from the calling thread.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::*;
use sendfd::{RecvWithFd, SendWithFd};
use tokio::sync::Notify;

use ferrobus_common::address::{self, AddressEntry};
use ferrobus_common::errors::{Error, Result};
use ferrobus_common::message::{parse_buffer, EitherFrame, Message, MessageKind};

use crate::auth;

const READ_CHUNK: usize = 4096;
const MAX_FDS_PER_READ: usize = 16;

struct OutFrame {
    bytes: Vec<u8>,
    offset: usize,
    fds: Vec<OwnedFd>,
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<OutFrame>,
}

#[derive(Default)]
struct Inbound {
    buffer: BytesMut,
    fds: Vec<OwnedFd>,
    queue: VecDeque<Message>,
}

pub(crate) struct Channel {
    stream: UnixStream,
    fd_passing: bool,
    serial: AtomicU32,
    closed: AtomicBool,
    nonblocking: AtomicBool,
    out: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    /// Wakes the executor's watch task when the write interest changes or
    /// the channel shuts down.
    pub(crate) watch_changed: Notify,
}

impl Channel {
    /// Connect to the first reachable entry of an address string and run
    /// the authentication handshake under `timeout`.
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let entries = address::parse(address)?;

        let mut last_err =
            Error::ConnectionFailed(format!("no usable transport in `{address}`"));
        for entry in &entries {
            match Self::connect_entry(entry) {
                Ok(stream) => return Self::from_stream(stream, timeout),
                Err(e) => {
                    debug!("Bus address entry failed: {e}");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    fn connect_entry(entry: &AddressEntry) -> Result<UnixStream> {
        if let Some(path) = entry.unix_path() {
            return UnixStream::connect(path)
                .map_err(|e| Error::ConnectionFailed(format!("connect to `{path}`: {e}")));
        }

        #[cfg(target_os = "linux")]
        if let Some(name) = entry.unix_abstract() {
            use std::os::linux::net::SocketAddrExt;

            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
            return UnixStream::connect_addr(&addr)
                .map_err(|e| Error::ConnectionFailed(format!("connect to `@{name}`: {e}")));
        }

        Err(Error::ConnectionFailed(format!(
            "unsupported transport `{}`",
            entry.transport()
        )))
    }

    fn from_stream(mut stream: UnixStream, timeout: Duration) -> Result<Self> {
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let fd_passing = auth::authenticate(&mut stream)?;

        stream
            .set_read_timeout(None)
            .and_then(|_| stream.set_write_timeout(None))
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            stream,
            fd_passing,
            serial: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            nonblocking: AtomicBool::new(false),
            out: Mutex::new(Outbound::default()),
            inbound: Mutex::new(Inbound::default()),
            watch_changed: Notify::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Switch the socket to the readiness-driven mode the executor needs.
    pub fn set_event_driven(&self) -> Result<()> {
        self.stream
            .set_nonblocking(true)
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        self.nonblocking.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the watch currently wants write readiness.
    pub fn wants_write(&self) -> bool {
        !self.out.lock().unwrap().queue.is_empty()
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::SeqCst);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Assign a serial, marshal and queue one outgoing message. In
    /// event-driven mode a flush is attempted inline and the watch task
    /// picks up whatever is left.
    pub fn queue(&self, msg: Message) -> Result<u32> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }

        let serial;
        {
            let mut out = self.out.lock().unwrap();
            serial = self.next_serial();
            let (bytes, fds) = msg.to_wire(serial)?;

            if !fds.is_empty() && !self.fd_passing {
                return Err(Error::SendFailure(
                    "peer does not accept file descriptors".into(),
                ));
            }

            out.queue.push_back(OutFrame {
                bytes,
                offset: 0,
                fds,
            });
        }

        if self.nonblocking.load(Ordering::SeqCst) {
            if let Err(e) = self.try_flush() {
                warn!("Flush after queueing failed: {e}");
            }
            self.watch_changed.notify_one();
        }

        Ok(serial)
    }

    /// Write queued frames until done or the socket stops accepting.
    pub fn try_flush(&self) -> io::Result<()> {
        let mut out = self.out.lock().unwrap();

        while let Some(frame) = out.queue.front_mut() {
            let raw_fds: Vec<RawFd> = frame.fds.iter().map(AsRawFd::as_raw_fd).collect();

            match self
                .stream
                .send_with_fd(&frame.bytes[frame.offset..], &raw_fds)
            {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    frame.offset += n;
                    // descriptors ride with the first chunk only
                    frame.fds.clear();
                    if frame.offset == frame.bytes.len() {
                        out.queue.pop_front();
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn flush_blocking(&self) -> Result<()> {
        self.try_flush().map_err(|e| {
            self.close();
            Error::SendFailure(e.to_string())
        })
    }

    /// Drain the readable socket. Returns the number of complete frames
    /// that became available; an error means the connection is gone.
    pub fn handle_readable(&self) -> Result<usize> {
        let mut inbound = self.inbound.lock().unwrap();
        let mut frames = 0;

        loop {
            let mut buf = [0u8; READ_CHUNK];
            let mut fd_buf = [0 as RawFd; MAX_FDS_PER_READ];

            match self.stream.recv_with_fd(&mut buf, &mut fd_buf) {
                Ok((0, 0)) => {
                    return if frames > 0 {
                        Ok(frames)
                    } else {
                        Err(Error::Disconnected)
                    }
                }
                Ok((n, nfds)) => {
                    inbound.buffer.extend_from_slice(&buf[..n]);
                    for &fd in &fd_buf[..nfds] {
                        inbound.fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                    frames += Self::reassemble(&mut inbound)?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(frames),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Socket read failed: {e}");
                    return Err(Error::Disconnected);
                }
            }
        }
    }

    fn reassemble(inbound: &mut Inbound) -> Result<usize> {
        let mut frames = 0;
        loop {
            let Inbound { buffer, fds, queue } = &mut *inbound;
            match parse_buffer(buffer, fds)? {
                EitherFrame::Full(msg) => {
                    queue.push_back(msg);
                    frames += 1;
                }
                EitherFrame::NeedMoreData(_) => return Ok(frames),
            }
        }
    }

    pub fn pop_inbound(&self) -> Option<Message> {
        self.inbound.lock().unwrap().queue.pop_front()
    }

    pub fn has_inbound(&self) -> bool {
        !self.inbound.lock().unwrap().queue.is_empty()
    }

    /// Send `msg` and block the calling thread until its reply arrives or
    /// the timeout elapses. Other inbound traffic read along the way stays
    /// queued for regular dispatch. Only usable before an executor drives
    /// the channel.
    pub fn blocking_round_trip(&self, msg: Message, timeout: Duration) -> Result<Message> {
        let serial = self.queue(msg)?;
        self.flush_blocking()?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.take_reply(serial) {
                return Ok(reply);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            self.stream
                .set_read_timeout(Some(deadline - now))
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

            match self.read_once_blocking() {
                Ok(()) => continue,
                Err(e) => {
                    if !matches!(e, Error::Timeout) {
                        self.close();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn read_once_blocking(&self) -> Result<()> {
        let mut inbound = self.inbound.lock().unwrap();
        let mut buf = [0u8; READ_CHUNK];
        let mut fd_buf = [0 as RawFd; MAX_FDS_PER_READ];

        match self.stream.recv_with_fd(&mut buf, &mut fd_buf) {
            Ok((0, 0)) => Err(Error::Disconnected),
            Ok((n, nfds)) => {
                inbound.buffer.extend_from_slice(&buf[..n]);
                for &fd in &fd_buf[..nfds] {
                    inbound.fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
                Self::reassemble(&mut inbound).map(drop)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Err(Error::Timeout)
            }
            Err(e) => {
                debug!("Socket read failed: {e}");
                Err(Error::Disconnected)
            }
        }
    }

    fn take_reply(&self, serial: u32) -> Option<Message> {
        let mut inbound = self.inbound.lock().unwrap();
        let index = inbound.queue.iter().position(|msg| {
            msg.reply_serial() == Some(serial)
                && matches!(
                    msg.kind(),
                    MessageKind::MethodReturn | MessageKind::Error
                )
        })?;
        inbound.queue.remove(index)
    }

    /// Tear the transport down. Idempotent; pending readers and the watch
    /// task observe the shutdown through their next operation.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.watch_changed.notify_one();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
