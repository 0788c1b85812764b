//! Typed client for a pool server.
//!
//! One [`PoolClient`] owns one connection and is not safe for concurrent
//! use; give each thread its own. Every command reads the security envelope
//! before its payload. Transport and protocol faults close the connection so
//! no command ever observes a half-consumed wire; security, busy and spawn
//! failures keep it open.

use crate::channel::MessageChannel;
use crate::error::{PoolError, Result};
use crate::options::{serialize_environment, PoolOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Channel shared between a client and the sessions it has handed out.
/// It closes when the last holder drops.
#[derive(Debug)]
struct SharedChannel {
    channel: Mutex<MessageChannel>,
}

impl SharedChannel {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MessageChannel>> {
        self.channel
            .lock()
            .map_err(|_| PoolError::Runtime("client channel poisoned".into()))
    }
}

/// Client stub mirroring the pool's interface over the wire.
pub struct PoolClient {
    data: Option<Arc<SharedChannel>>,
    authenticated: bool,
}

impl PoolClient {
    pub fn new() -> Self {
        Self {
            data: None,
            authenticated: false,
        }
    }

    /// Connect and authenticate. May be called at most once per client.
    ///
    /// On a `Security` error the connection is kept; retry with
    /// [`PoolClient::authenticate`].
    pub fn connect(
        &mut self,
        socket_path: impl AsRef<Path>,
        username: &[u8],
        password: &[u8],
    ) -> Result<()> {
        if self.data.is_some() {
            return Err(PoolError::Runtime(
                "connect() may only be called once per client".into(),
            ));
        }
        let stream = UnixStream::connect(socket_path.as_ref())?;
        self.data = Some(Arc::new(SharedChannel {
            channel: Mutex::new(MessageChannel::new(stream)),
        }));
        self.authenticate(username, password)
    }

    /// Present credentials. Retryable after a `Security` failure.
    pub fn authenticate(&mut self, username: &[u8], password: &[u8]) -> Result<()> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| {
                PoolError::Runtime("connect() has not been called on this client".into())
            })?
            .clone();
        let outcome = (|| {
            let mut channel = data.lock()?;
            channel.write_scalar(username)?;
            channel.write_scalar(password)?;
            match channel.read_vec_utf8()? {
                None => Err(PoolError::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                ))),
                Some(reply) => match reply.first().map(String::as_str) {
                    Some("ok") => Ok(()),
                    Some("SecurityException") => Err(PoolError::Security(
                        reply.get(1).cloned().unwrap_or_else(|| "denied".into()),
                    )),
                    _ => Err(PoolError::Protocol(format!(
                        "invalid authentication reply: {:?}",
                        reply
                    ))),
                },
            }
        })();
        match outcome {
            Ok(()) => {
                self.authenticated = true;
                Ok(())
            }
            Err(e) => {
                if !e.is_recoverable() {
                    self.disconnect();
                }
                Err(e)
            }
        }
    }

    /// Whether the underlying connection is still open.
    pub fn connected(&self) -> bool {
        match &self.data {
            Some(data) => data
                .channel
                .lock()
                .map(|ch| ch.connected())
                .unwrap_or(false),
            None => false,
        }
    }

    /// Check out a session for the given application.
    pub fn get(&mut self, options: &PoolOptions) -> Result<RemoteSession> {
        let data = self.shared()?.clone();
        let environment = options.environment.clone();
        let result = (|| {
            let mut channel = data.lock()?;
            let mut fields = vec!["get".to_string()];
            fields.extend(options.to_vec(false));
            channel.write_vec(&fields)?;
            check_security(&mut channel)?;

            // The server may ask for environment variables any number of
            // times before the final reply.
            let reply = loop {
                let reply = read_reply(&mut channel)?;
                if reply.first().map(String::as_str) == Some("getEnvironmentVariables") {
                    let blob = environment
                        .as_ref()
                        .map(|env| serialize_environment(env))
                        .unwrap_or_default();
                    channel.write_scalar(blob.as_bytes())?;
                } else {
                    break reply;
                }
            };

            match reply.first().map(String::as_str) {
                Some("ok") => {
                    let pid: i32 = parse_field(&reply, 1)?;
                    let id: u32 = parse_field(&reply, 2)?;
                    let fd = channel.recv_fd()?;
                    Ok((pid, id, fd))
                }
                Some("SpawnException") => {
                    let message = reply.get(1).cloned().unwrap_or_default();
                    let error_page = if reply.get(2).map(String::as_str) == Some("true") {
                        Some(read_scalar_reply(&mut channel)?)
                    } else {
                        None
                    };
                    Err(PoolError::Spawn {
                        message,
                        error_page,
                    })
                }
                Some("BusyException") => Err(PoolError::Busy(
                    reply.get(1).cloned().unwrap_or_else(|| "busy".into()),
                )),
                Some("IOException") => Err(PoolError::Protocol(
                    reply.get(1).cloned().unwrap_or_else(|| "I/O error".into()),
                )),
                _ => Err(PoolError::Protocol(format!(
                    "unknown reply to get: {:?}",
                    reply
                ))),
            }
        })();

        match result {
            Ok((pid, id, fd)) => Ok(RemoteSession {
                data,
                pid,
                id,
                fd: Some(fd),
            }),
            Err(e) => {
                if !e.is_recoverable() {
                    self.disconnect();
                }
                Err(e)
            }
        }
    }

    /// Detach every worker in the pool.
    pub fn clear(&mut self) -> Result<()> {
        self.command(&["clear"], |channel| expect_ok(read_reply(channel)?))
    }

    pub fn set_max_idle_time(&mut self, seconds: u64) -> Result<()> {
        let seconds = seconds.to_string();
        self.command(&["setMaxIdleTime", seconds.as_str()], |_| Ok(()))
    }

    pub fn set_max(&mut self, max: u32) -> Result<()> {
        let max = max.to_string();
        self.command(&["setMax", max.as_str()], |_| Ok(()))
    }

    pub fn set_max_per_app(&mut self, max: u32) -> Result<()> {
        let max = max.to_string();
        self.command(&["setMaxPerApp", max.as_str()], |_| Ok(()))
    }

    pub fn get_active(&mut self) -> Result<u32> {
        self.command(&["getActive"], |channel| {
            parse_field(&read_reply(channel)?, 0)
        })
    }

    pub fn get_count(&mut self) -> Result<u32> {
        self.command(&["getCount"], |channel| {
            parse_field(&read_reply(channel)?, 0)
        })
    }

    pub fn get_spawn_server_pid(&mut self) -> Result<i32> {
        self.command(&["getSpawnServerPid"], |channel| {
            parse_field(&read_reply(channel)?, 0)
        })
    }

    /// Take one worker out of rotation, keeping it warm. Returns false
    /// when the pool does not know the pid.
    pub fn disable_process(&mut self, pid: i32) -> Result<bool> {
        let pid = pid.to_string();
        self.command(&["disableProcess", pid.as_str()], |channel| {
            parse_field(&read_reply(channel)?, 0)
        })
    }

    /// Bring a disabled worker back into rotation. Returns false when the
    /// pool does not know the pid.
    pub fn enable_process(&mut self, pid: i32) -> Result<bool> {
        let pid = pid.to_string();
        self.command(&["enableProcess", pid.as_str()], |channel| {
            parse_field(&read_reply(channel)?, 0)
        })
    }

    /// Fetch the server's textual pool snapshot.
    pub fn inspect(&mut self) -> Result<String> {
        self.command(&["inspect"], |channel| {
            let blob = read_scalar_reply(channel)?;
            String::from_utf8(blob)
                .map_err(|_| PoolError::Protocol("snapshot is not UTF-8".into()))
        })
    }

    /// Write one command, check the envelope, parse the payload. Closes
    /// the connection on any non-recoverable failure.
    fn command<T>(
        &mut self,
        fields: &[&str],
        parse: impl FnOnce(&mut MessageChannel) -> Result<T>,
    ) -> Result<T> {
        let data = self.shared()?.clone();
        let result = (|| {
            let mut channel = data.lock()?;
            channel.write_vec(fields)?;
            check_security(&mut channel)?;
            parse(&mut channel)
        })();
        if let Err(e) = &result {
            if !e.is_recoverable() {
                self.disconnect();
            }
        }
        result
    }

    fn shared(&self) -> Result<&Arc<SharedChannel>> {
        let data = self.data.as_ref().ok_or_else(|| {
            PoolError::Runtime("connect() has not been called on this client".into())
        })?;
        if !self.authenticated {
            return Err(PoolError::Runtime(
                "client has not authenticated yet".into(),
            ));
        }
        Ok(data)
    }

    fn disconnect(&mut self) {
        if let Some(data) = &self.data {
            if let Ok(mut channel) = data.channel.lock() {
                channel.close();
            }
        }
    }
}

impl Default for PoolClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A session checked out from a remote pool.
///
/// Holds the duplex stream to the worker and a share of the client's
/// channel; the channel outlives the client while sessions exist. Dropping
/// the session closes the stream and tells the server, best-effort.
#[derive(Debug)]
pub struct RemoteSession {
    data: Arc<SharedChannel>,
    pid: i32,
    id: u32,
    fd: Option<OwnedFd>,
}

impl RemoteSession {
    /// Pid of the worker behind the stream.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Borrow the duplex stream, if still owned.
    pub fn stream(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Stop reading from the stream.
    pub fn shutdown_reader(&self) -> Result<()> {
        self.shutdown_half(nix::sys::socket::Shutdown::Read)
    }

    /// Finish writing to the stream; the worker sees EOF when it reads.
    pub fn shutdown_writer(&self) -> Result<()> {
        self.shutdown_half(nix::sys::socket::Shutdown::Write)
    }

    /// Close the stream. Idempotent.
    pub fn close_stream(&mut self) -> Result<()> {
        if let Some(fd) = self.fd.take() {
            nix::unistd::close(fd.into_raw_fd())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        }
        Ok(())
    }

    /// Relinquish the stream without closing: the caller has taken over
    /// the raw descriptor.
    pub fn discard_stream(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = fd.into_raw_fd();
        }
    }

    fn shutdown_half(&self, how: nix::sys::socket::Shutdown) -> Result<()> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| PoolError::Runtime("session stream already closed".into()))?;
        nix::sys::socket::shutdown(fd.as_raw_fd(), how)
            .map_err(|e| PoolError::Io(std::io::Error::from_raw_os_error(e as i32)))
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Err(e) = self.close_stream() {
            tracing::debug!(pid = self.pid, session = self.id, error = %e,
                "Error closing remote session stream");
        }
        // Tell the server the slot is free. Best-effort: the connection
        // may already be gone, and a session must never take the process
        // down with it.
        let notify = (|| -> Result<()> {
            let mut channel = self.data.lock()?;
            if !channel.connected() {
                return Ok(());
            }
            let id = self.id.to_string();
            channel.write_vec(&["close", id.as_str()])
        })();
        if let Err(e) = notify {
            tracing::debug!(pid = self.pid, session = self.id, error = %e,
                "Session close notification not delivered");
        }
    }
}

fn check_security(channel: &mut MessageChannel) -> Result<()> {
    let reply = read_reply(channel)?;
    match reply.first().map(String::as_str) {
        Some("Passed security") => Ok(()),
        Some("SecurityException") => Err(PoolError::Security(
            reply.get(1).cloned().unwrap_or_else(|| "denied".into()),
        )),
        _ => Err(PoolError::Protocol(format!(
            "invalid security envelope: {:?}",
            reply
        ))),
    }
}

fn read_reply(channel: &mut MessageChannel) -> Result<Vec<String>> {
    channel
        .read_vec_utf8()?
        .ok_or_else(|| PoolError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))
}

fn read_scalar_reply(channel: &mut MessageChannel) -> Result<Vec<u8>> {
    channel
        .read_scalar()?
        .ok_or_else(|| PoolError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)))
}

fn expect_ok(reply: Vec<String>) -> Result<()> {
    if reply.first().map(String::as_str) == Some("ok") {
        Ok(())
    } else {
        Err(PoolError::Protocol(format!(
            "expected ok, server said: {:?}",
            reply
        )))
    }
}

fn parse_field<T: std::str::FromStr>(reply: &[String], index: usize) -> Result<T> {
    reply
        .get(index)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| PoolError::Protocol(format!("malformed reply: {:?}", reply)))
}
