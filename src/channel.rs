//! Framed message channel over a local stream socket.
//!
//! Carries three kinds of traffic, never mixed within one frame:
//!
//! - **vector messages**: a sequence of non-empty NUL-terminated fields closed
//!   by an empty field, prefixed by a 16-bit big-endian length of the payload;
//! - **scalars**: one opaque blob prefixed by a 32-bit big-endian length;
//! - **file descriptors**: one per call, as SCM_RIGHTS ancillary data riding
//!   on a single marker byte.
//!
//! Reads and writes are unbuffered so that descriptor passing never races
//! against bytes sitting in a userspace buffer. EINTR before the first byte
//! of a frame surfaces as [`PoolError::Interrupted`]; once a frame is partly
//! transferred the call retries until the frame is complete, so the peer
//! never observes a torn frame.

use crate::error::{PoolError, Result};
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Upper bound on a scalar payload (128 MiB). Anything larger is treated as
/// a protocol violation rather than an allocation request.
const MAX_SCALAR_LEN: usize = 128 * 1024 * 1024;

/// A framed, bidirectional channel over a Unix stream socket.
///
/// Not safe for concurrent use; wrap in a `Mutex` when shared.
pub struct MessageChannel {
    stream: Option<UnixStream>,
}

impl MessageChannel {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Create a connected channel pair, one for each direction endpoint.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Whether the channel still holds an open stream.
    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Drop the underlying stream. Subsequent operations fail with `Runtime`.
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Duplicate the underlying stream handle, e.g. so another thread can
    /// `shutdown(2)` it to unblock a pending read.
    pub fn try_clone_stream(&self) -> Result<UnixStream> {
        Ok(self.stream()?.try_clone()?)
    }

    /// Set the deadline applied to each blocking read. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream()?.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set the deadline applied to each blocking write. `None` blocks forever.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream()?.set_write_timeout(timeout)?;
        Ok(())
    }

    fn stream(&self) -> Result<&UnixStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| PoolError::Runtime("channel is closed".into()))
    }

    /// Write one vector message atomically.
    ///
    /// Fields must be non-empty; an empty field is the frame terminator and
    /// would truncate the message on the receiving side.
    pub fn write_vec<T: AsRef<[u8]>>(&mut self, fields: &[T]) -> Result<()> {
        let mut payload = Vec::with_capacity(64);
        for field in fields {
            let bytes = field.as_ref();
            if bytes.is_empty() {
                return Err(PoolError::Protocol(
                    "cannot write an empty message field".into(),
                ));
            }
            if bytes.contains(&0) {
                return Err(PoolError::Protocol(
                    "message field contains a NUL byte".into(),
                ));
            }
            payload.extend_from_slice(bytes);
            payload.push(0);
        }
        payload.push(0);

        let len = payload.len();
        if len > u16::MAX as usize {
            return Err(PoolError::Protocol(format!(
                "message of {} bytes exceeds the 16-bit frame limit",
                len
            )));
        }

        let mut frame = Vec::with_capacity(len + 2);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
        frame.extend_from_slice(&payload);
        self.write_all_frame(&frame)
    }

    /// Read one vector message. Returns `None` on clean EOF (no frame byte
    /// received at all).
    pub fn read_vec(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        let mut header = [0u8; 2];
        if self.read_exact_frame(&mut header, true)?.is_none() {
            return Ok(None);
        }
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(PoolError::Protocol("zero-length message frame".into()));
        }

        let mut payload = vec![0u8; len];
        self.read_exact_frame(&mut payload, false)?;

        let mut fields = Vec::new();
        let mut pos = 0;
        loop {
            let nul = payload[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| PoolError::Protocol("unterminated message field".into()))?;
            let field = &payload[pos..pos + nul];
            pos += nul + 1;
            if field.is_empty() {
                if pos != payload.len() {
                    return Err(PoolError::Protocol(
                        "trailing bytes after message terminator".into(),
                    ));
                }
                return Ok(Some(fields));
            }
            fields.push(field.to_vec());
        }
    }

    /// Read one vector message and decode every field as UTF-8.
    pub fn read_vec_utf8(&mut self) -> Result<Option<Vec<String>>> {
        match self.read_vec()? {
            None => Ok(None),
            Some(fields) => fields
                .into_iter()
                .map(|f| {
                    String::from_utf8(f)
                        .map_err(|_| PoolError::Protocol("message field is not UTF-8".into()))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
        }
    }

    /// Write one opaque scalar blob as its own frame.
    pub fn write_scalar(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_SCALAR_LEN {
            return Err(PoolError::Protocol(format!(
                "scalar of {} bytes exceeds the size limit",
                data.len()
            )));
        }
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);
        self.write_all_frame(&frame)
    }

    /// Read one scalar blob. Returns `None` on clean EOF.
    pub fn read_scalar(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        if self.read_exact_frame(&mut header, true)?.is_none() {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_SCALAR_LEN {
            return Err(PoolError::Protocol(format!(
                "scalar of {} bytes exceeds the size limit",
                len
            )));
        }
        let mut data = vec![0u8; len];
        if len > 0 {
            self.read_exact_frame(&mut data, false)?;
        }
        Ok(Some(data))
    }

    /// Pass one file descriptor to the peer.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        let stream = self.stream()?;
        let raw = stream.as_raw_fd();
        let fds = [fd.as_raw_fd()];
        let iov = [IoSlice::new(b"!")];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        match sendmsg::<()>(raw, &iov, &cmsg, MsgFlags::empty(), None) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Err(PoolError::Interrupted),
            Err(nix::errno::Errno::EAGAIN) => Err(PoolError::Timeout),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32).into()),
        }
    }

    /// Receive one file descriptor from the peer.
    pub fn recv_fd(&mut self) -> Result<OwnedFd> {
        let stream = self.stream()?;
        let raw = stream.as_raw_fd();
        let mut marker = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut marker)];
        let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
        let msg = match recvmsg::<()>(raw, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty()) {
            Ok(msg) => msg,
            Err(nix::errno::Errno::EINTR) => return Err(PoolError::Interrupted),
            Err(nix::errno::Errno::EAGAIN) => return Err(PoolError::Timeout),
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32).into()),
        };
        if msg.bytes == 0 {
            return Err(PoolError::Protocol(
                "peer closed the connection while passing a descriptor".into(),
            ));
        }
        let mut received = None;
        for cmsg in msg
            .cmsgs()
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?
        {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received = fds.first().copied();
            }
        }
        match received {
            // The kernel has already installed the descriptor in this
            // process; ownership transfers to the caller.
            Some(fd) => Ok(unsafe {
                use std::os::fd::FromRawFd;
                OwnedFd::from_raw_fd(fd)
            }),
            None => Err(PoolError::Protocol(
                "descriptor marker arrived without ancillary data".into(),
            )),
        }
    }

    /// Write a whole frame, retrying EINTR once any byte of it has gone out.
    fn write_all_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut stream = self.stream()?;
        let mut written = 0;
        while written < frame.len() {
            match stream.write(&frame[written..]) {
                Ok(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if written == 0 {
                        return Err(PoolError::Interrupted);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(PoolError::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes. With `eof_ok`, EOF before the first
    /// byte yields `None`; EOF mid-frame is always a protocol fault.
    fn read_exact_frame(&mut self, buf: &mut [u8], eof_ok: bool) -> Result<Option<()>> {
        let mut stream = self.stream()?;
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled == 0 && eof_ok {
                        return Ok(None);
                    }
                    return Err(PoolError::Protocol(
                        "peer closed the connection mid-frame".into(),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if filled == 0 && eof_ok {
                        return Err(PoolError::Interrupted);
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(PoolError::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(()))
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("connected", &self.connected())
            .finish()
    }
}
