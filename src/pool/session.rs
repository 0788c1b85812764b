//! A checked-out request slot on one worker.

use crate::error::Result;
use crate::pool::Pool;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::sync::Weak;

/// One outstanding session.
///
/// While a `Session` is alive its worker's session counter stays raised;
/// dropping it (or any other path to release) lowers the counter exactly
/// once, stamps the worker's `last_used`, and lets queued requests take the
/// freed slot. The duplex stream is owned until it is taken, closed, or
/// discarded.
pub struct Session {
    pool: Weak<Pool>,
    app_root: String,
    app_group: String,
    pid: i32,
    id: u32,
    stream: Option<OwnedFd>,
    released: bool,
}

impl Session {
    pub(crate) fn new(
        pool: Weak<Pool>,
        app_root: String,
        app_group: String,
        pid: i32,
        id: u32,
        stream: OwnedFd,
    ) -> Self {
        Self {
            pool,
            app_root,
            app_group,
            pid,
            id,
            stream: Some(stream),
            released: false,
        }
    }

    /// Pid of the worker hosting this session.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The worker-assigned session id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Borrow the duplex stream, if still owned.
    pub fn stream(&self) -> Option<BorrowedFd<'_>> {
        self.stream.as_ref().map(|fd| fd.as_fd())
    }

    /// Take ownership of the duplex stream, e.g. to pass it to a client.
    /// The session keeps holding its worker slot.
    pub fn take_stream(&mut self) -> Option<OwnedFd> {
        self.stream.take()
    }

    /// Close the duplex stream. Idempotent; the first call reports any
    /// close error, later calls are no-ops.
    pub fn close_stream(&mut self) -> Result<()> {
        if let Some(fd) = self.stream.take() {
            nix::unistd::close(fd.into_raw_fd())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        }
        Ok(())
    }

    /// Relinquish the stream without closing it. The caller has taken over
    /// the raw descriptor by other means.
    pub fn discard_stream(&mut self) {
        if let Some(fd) = self.stream.take() {
            let _ = fd.into_raw_fd();
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.release_session(&self.app_root, &self.app_group, self.pid);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close_stream() {
            tracing::debug!(pid = self.pid, session = self.id, error = %e,
                "Error closing session stream");
        }
        self.release();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .field("id", &self.id)
            .field("app_group", &self.app_group)
            .field("stream_open", &self.stream.is_some())
            .finish()
    }
}
