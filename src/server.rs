//! The pool server: accepts clients on a local socket and dispatches
//! commands.
//!
//! Every connection is handled by its own thread. After authentication,
//! each command is answered with a security envelope (`Passed security` or
//! `SecurityException`) before any payload, so clients can tell auth-layer
//! failures from application-layer ones without reconnecting.

use crate::auth::Authenticator;
use crate::channel::MessageChannel;
use crate::error::{PoolError, Result};
use crate::options::{parse_environment, PoolOptions};
use crate::pool::{Pool, Session};
use std::collections::HashMap;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How often the accept loop checks the stop flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pool server on a filesystem socket.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    pool: Arc<Pool>,
    authenticator: Arc<dyn Authenticator>,
    stop: AtomicBool,
    next_conn_id: AtomicU64,
    /// Duplicate handles of live connections, for unblocking their reads
    /// at shutdown.
    connections: Mutex<HashMap<u64, UnixStream>>,
}

impl Server {
    /// Bind the server socket with mode 0600. A stale socket file at the
    /// path is replaced.
    pub fn bind(
        socket_path: impl AsRef<Path>,
        pool: Arc<Pool>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;
        tracing::info!(socket = %socket_path.display(), "Pool server listening");

        Ok(Arc::new(Self {
            listener,
            socket_path,
            pool,
            authenticator,
            stop: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        }))
    }

    /// Accept and serve connections until [`Server::stop`] is called.
    pub fn run(self: Arc<Self>) {
        let mut handles: Vec<std::thread::JoinHandle<()>> = Vec::new();
        while !self.stop.load(Ordering::Relaxed) {
            handles.retain(|handle| !handle.is_finished());
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Some(handle) = start_connection(&self, stream) {
                        handles.push(handle);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        // Unblock every connection thread, then wait for them.
        let connections = std::mem::take(
            &mut *self.connections.lock().expect("connection registry poisoned"),
        );
        for (_, stream) in connections {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for handle in handles {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("Pool server stopped");
    }

    /// Ask the accept loop to wind down. Safe from any thread, including a
    /// signal watcher.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn start_connection(
    server: &Arc<Server>,
    stream: UnixStream,
) -> Option<std::thread::JoinHandle<()>> {
    let conn_id = server.next_conn_id.fetch_add(1, Ordering::Relaxed);
    if stream.set_nonblocking(false).is_err() {
        return None;
    }
    if let Ok(clone) = stream.try_clone() {
        server
            .connections
            .lock()
            .expect("connection registry poisoned")
            .insert(conn_id, clone);
    }

    let server = server.clone();
    std::thread::Builder::new()
        .name(format!("pool-conn-{}", conn_id))
        .spawn(move || {
            let mut conn = Connection {
                channel: MessageChannel::new(stream),
                pool: server.pool.clone(),
                authenticator: server.authenticator.clone(),
                sessions: HashMap::new(),
                next_session_id: 0,
            };
            if let Err(e) = conn.serve() {
                tracing::debug!(conn = conn_id, error = %e, "Connection ended");
            }
            server
                .connections
                .lock()
                .expect("connection registry poisoned")
                .remove(&conn_id);
        })
        .ok()
}

/// One client connection: its channel and the sessions it has checked out,
/// keyed by connection-scoped ids.
struct Connection {
    channel: MessageChannel,
    pool: Arc<Pool>,
    authenticator: Arc<dyn Authenticator>,
    sessions: HashMap<u32, Session>,
    next_session_id: u32,
}

impl Connection {
    fn serve(&mut self) -> Result<()> {
        self.authenticate()?;
        loop {
            let fields = match self.channel.read_vec_utf8()? {
                Some(fields) => fields,
                None => return Ok(()), // client left; sessions drop with us
            };
            let Some(command) = fields.first() else {
                continue;
            };
            match command.as_str() {
                "get" => self.cmd_get(&fields[1..])?,
                "close" => self.cmd_close(&fields[1..]),
                "clear" => {
                    self.pass_security()?;
                    self.pool.clear();
                    self.channel.write_vec(&["ok"])?;
                }
                "setMaxIdleTime" => {
                    self.pass_security()?;
                    let seconds = parse_arg(&fields, 1)?;
                    self.pool.set_max_idle_time(Duration::from_secs(seconds));
                }
                "setMax" => {
                    self.pass_security()?;
                    let max = parse_arg(&fields, 1)?;
                    self.pool.set_max(max as u32);
                }
                "setMaxPerApp" => {
                    self.pass_security()?;
                    let max = parse_arg(&fields, 1)?;
                    self.pool.set_max_per_app(max as u32);
                }
                "getActive" => {
                    self.pass_security()?;
                    let n = self.pool.get_active();
                    self.channel.write_vec(&[n.to_string()])?;
                }
                "getCount" => {
                    self.pass_security()?;
                    let n = self.pool.get_count();
                    self.channel.write_vec(&[n.to_string()])?;
                }
                "getSpawnServerPid" => {
                    self.pass_security()?;
                    let pid = self.pool.spawn_server_pid();
                    self.channel.write_vec(&[pid.to_string()])?;
                }
                "disableProcess" => {
                    self.pass_security()?;
                    let pid = parse_arg(&fields, 1)?;
                    let done = self.pool.disable_process(pid as i32);
                    self.channel.write_vec(&[done.to_string()])?;
                }
                "enableProcess" => {
                    self.pass_security()?;
                    let pid = parse_arg(&fields, 1)?;
                    let done = self.pool.enable_process(pid as i32);
                    self.channel.write_vec(&[done.to_string()])?;
                }
                "inspect" => {
                    self.pass_security()?;
                    let snapshot = self.pool.inspect();
                    self.channel.write_scalar(snapshot.as_bytes())?;
                }
                other => {
                    let text = format!("unknown command: {}", other);
                    self.channel.write_vec(&["IOException", text.as_str()])?;
                    return Err(PoolError::Protocol(text));
                }
            }
        }
    }

    /// Read username/password scalars until the authenticator accepts
    /// them. A rejected pair keeps the connection open for another try.
    fn authenticate(&mut self) -> Result<()> {
        loop {
            let Some(username) = self.channel.read_scalar()? else {
                return Err(PoolError::Protocol(
                    "client left before authenticating".into(),
                ));
            };
            let Some(password) = self.channel.read_scalar()? else {
                return Err(PoolError::Protocol(
                    "client left before authenticating".into(),
                ));
            };
            if self.authenticator.authenticate(&username, &password) {
                self.channel.write_vec(&["ok"])?;
                return Ok(());
            }
            tracing::info!("Client failed authentication");
            self.channel
                .write_vec(&["SecurityException", "invalid username or password"])?;
        }
    }

    fn pass_security(&mut self) -> Result<()> {
        self.channel.write_vec(&["Passed security"])
    }

    fn cmd_get(&mut self, option_fields: &[String]) -> Result<()> {
        self.pass_security()?;

        let mut options = match PoolOptions::from_vec(option_fields) {
            Ok(options) => options,
            Err(e) => {
                let text = wire_text(&e.to_string());
                self.channel.write_vec(&["IOException", text.as_str()])?;
                return Err(e);
            }
        };

        // Environment variables are delivered lazily; pull them in before
        // the request can reach a spawner.
        if options.environment.is_none() {
            self.channel.write_vec(&["getEnvironmentVariables"])?;
            let blob = self.channel.read_scalar()?.ok_or_else(|| {
                PoolError::Protocol("client left during the environment exchange".into())
            })?;
            options.environment = Some(parse_environment(&blob)?);
        }

        match self.pool.get(&options) {
            Ok(mut session) => {
                let fd = session.take_stream().ok_or_else(|| {
                    PoolError::Runtime("checked-out session carries no stream".into())
                })?;
                let id = self.next_session_id;
                self.next_session_id = self.next_session_id.wrapping_add(1);
                let pid_field = session.pid().to_string();
                let id_field = id.to_string();
                self.channel
                    .write_vec(&["ok", pid_field.as_str(), id_field.as_str()])?;
                self.channel.send_fd(fd.as_fd())?;
                // The client now owns its duplicate; ours closes here. The
                // session object stays for the counter until "close".
                drop(fd);
                self.sessions.insert(id, session);
                Ok(())
            }
            Err(PoolError::Spawn {
                message,
                error_page,
            }) => {
                let has_page = if error_page.is_some() { "true" } else { "false" };
                let message = wire_text(&message);
                self.channel
                    .write_vec(&["SpawnException", message.as_str(), has_page])?;
                if let Some(page) = error_page {
                    self.channel.write_scalar(&page)?;
                }
                Ok(())
            }
            Err(PoolError::Busy(message)) => {
                let message = wire_text(&message);
                self.channel
                    .write_vec(&["BusyException", message.as_str()])?;
                Ok(())
            }
            Err(e) => {
                let text = wire_text(&e.to_string());
                self.channel.write_vec(&["IOException", text.as_str()])?;
                Err(e)
            }
        }
    }

    fn cmd_close(&mut self, args: &[String]) {
        let Some(id) = args.first().and_then(|a| a.parse::<u32>().ok()) else {
            tracing::debug!(?args, "Malformed close command ignored");
            return;
        };
        // Dropping the session releases the worker slot. Unknown ids are
        // ignored: close is idempotent from the client's point of view.
        self.sessions.remove(&id);
    }
}

/// Make arbitrary text safe as a wire field: non-empty and NUL-free.
fn wire_text(text: &str) -> String {
    let cleaned = text.replace('\0', " ");
    if cleaned.is_empty() {
        "-".to_string()
    } else {
        cleaned
    }
}

fn parse_arg(fields: &[String], index: usize) -> Result<u64> {
    fields
        .get(index)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| PoolError::Protocol(format!("malformed {} command", fields[0])))
}
