//! End-to-end tests: a pool server on a real socket, driven through the
//! client stub, with stub application workers that echo on their session
//! streams.

use procpool::auth::SingleAccount;
use procpool::channel::MessageChannel;
use procpool::client::PoolClient;
use procpool::error::{PoolError, Result};
use procpool::options::PoolOptions;
use procpool::pool::{Pool, PoolConfig};
use procpool::server::Server;
use procpool::spawn::{AppProcess, SpawnedWorker, Spawner, SpawnerFactory};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const USERNAME: &[u8] = b"pool";
const PASSWORD: &[u8] = b"hunter2";

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

static NEXT_FAKE_PID: AtomicI32 = AtomicI32::new(200_000);

struct StubApp {
    pid: i32,
    alive: Arc<AtomicBool>,
}

impl AppProcess for StubApp {
    fn pid(&self) -> i32 {
        self.pid
    }
    fn try_wait(&mut self) -> Result<bool> {
        Ok(!self.alive.load(Ordering::Relaxed))
    }
    fn terminate(&mut self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        Ok(())
    }
    fn kill(&mut self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Spawner whose workers are threads speaking the worker control protocol:
/// `spawn <secret>` is answered with one end of a fresh socketpair, which
/// then echoes whatever the client writes.
#[derive(Default)]
struct StubSpawner {
    fail_spawns: AtomicBool,
    spawn_count: AtomicU32,
    last_used: AtomicU64,
}

impl Spawner for StubSpawner {
    fn spawn(&self, _options: &PoolOptions, secret: &str) -> Result<SpawnedWorker> {
        self.last_used.store(now_usec(), Ordering::Relaxed);
        if self.fail_spawns.load(Ordering::Relaxed) {
            return Err(PoolError::Spawn {
                message: "boom".into(),
                error_page: None,
            });
        }
        self.spawn_count.fetch_add(1, Ordering::Relaxed);

        let (pool_side, mut worker_side) = MessageChannel::pair()?;
        let pid = NEXT_FAKE_PID.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let expected = secret.to_string();

        std::thread::spawn({
            let alive = alive.clone();
            move || {
                loop {
                    match worker_side.read_vec_utf8() {
                        Ok(Some(fields))
                            if fields.first().map(String::as_str) == Some("spawn")
                                && fields.get(1).map(String::as_str)
                                    == Some(expected.as_str()) =>
                        {
                            let Ok((ours, theirs)) = UnixStream::pair() else {
                                break;
                            };
                            if worker_side.send_fd(theirs.as_fd()).is_err() {
                                break;
                            }
                            std::thread::spawn(move || {
                                let mut stream = ours;
                                let mut buf = [0u8; 4096];
                                while let Ok(n) = stream.read(&mut buf) {
                                    if n == 0 || stream.write_all(&buf[..n]).is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                        _ => break, // shutdown, EOF or garbage
                    }
                }
                alive.store(false, Ordering::Relaxed);
            }
        });

        Ok(SpawnedWorker {
            process: Box::new(StubApp { pid, alive }),
            channel: pool_side,
        })
    }

    fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }
}

struct StubFactory {
    template: Arc<StubSpawner>,
}

impl SpawnerFactory for StubFactory {
    fn create(&self, _options: &PoolOptions) -> Box<dyn Spawner> {
        struct Shim(Arc<StubSpawner>);
        impl Spawner for Shim {
            fn spawn(&self, options: &PoolOptions, secret: &str) -> Result<SpawnedWorker> {
                self.0.spawn(options, secret)
            }
            fn last_used(&self) -> u64 {
                self.0.last_used()
            }
        }
        Box::new(Shim(self.template.clone()))
    }
}

/// One running server plus everything needed to talk to it and tear it
/// down.
struct TestServer {
    socket: PathBuf,
    pool: Arc<Pool>,
    server: Arc<Server>,
    spawner: Arc<StubSpawner>,
    thread: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn start(config: PoolConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("pool.sock");
        let spawner = Arc::new(StubSpawner::default());
        let pool = Pool::new(
            config,
            Arc::new(StubFactory {
                template: spawner.clone(),
            }),
        );
        let authenticator = Arc::new(SingleAccount::new(USERNAME, PASSWORD));
        let server = Server::bind(&socket, pool.clone(), authenticator).expect("bind");
        let thread = std::thread::spawn({
            let server = server.clone();
            move || server.run()
        });
        Self {
            socket,
            pool,
            server,
            spawner,
            thread: Some(thread),
            _dir: dir,
        }
    }

    fn client(&self) -> PoolClient {
        let mut client = PoolClient::new();
        client
            .connect(&self.socket, USERNAME, PASSWORD)
            .expect("connect");
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.pool.shutdown();
    }
}

fn small_pool_config() -> PoolConfig {
    PoolConfig {
        max: 4,
        max_per_app: 2,
        max_idle_time: Duration::ZERO,
        get_timeout: Duration::from_secs(5),
    }
}

fn app_options(root: &str) -> PoolOptions {
    let mut options = PoolOptions::new(root);
    options.max_processes = 2;
    options.concurrency = 1;
    options.environment = Some(vec![("RAILS_ENV".into(), "production".into())]);
    options
}

fn echo_roundtrip(session: &procpool::client::RemoteSession, payload: &[u8]) {
    let fd = session.stream().expect("stream open");
    let mut stream = fd
        .try_clone_to_owned()
        .map(UnixStream::from)
        .expect("clone stream");
    stream.write_all(payload).unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, payload);
}

#[test]
fn test_s1_cold_get() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    let session = client.get(&app_options("/a")).expect("cold get");
    assert!(session.pid() >= 200_000);
    assert_eq!(ts.spawner.spawn_count.load(Ordering::Relaxed), 1);
    echo_roundtrip(&session, b"GET / HTTP/1.0\r\n\r\n");

    assert_eq!(client.get_count().unwrap(), 1);
    assert_eq!(client.get_active().unwrap(), 1);

    drop(session);
    // The close notification travels on the same connection ahead of the
    // next command, so the counters are already settled here.
    assert_eq!(client.get_active().unwrap(), 0);
    assert_eq!(client.get_count().unwrap(), 1);
}

#[test]
fn test_s2_saturation_queueing() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();
    let options = app_options("/a");

    let s1 = client.get(&options).unwrap();
    let mut client2 = ts.client();
    let s2 = client2.get(&options).unwrap();
    assert_eq!(client.get_active().unwrap(), 2);
    assert_eq!(client.get_count().unwrap(), 2);

    // A third request has nowhere to go; it queues on the group.
    let waiter = std::thread::spawn({
        let socket = ts.socket.clone();
        let options = options.clone();
        move || {
            let mut client = PoolClient::new();
            client.connect(&socket, USERNAME, PASSWORD).unwrap();
            let session = client.get(&options)?;
            Ok::<i32, PoolError>(session.pid())
        }
    });
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ts.pool.get_count(), 2, "no third worker may spawn");

    let released_pid = s1.pid();
    drop(s1);
    let served_pid = waiter.join().unwrap().expect("queued get succeeds");
    assert_eq!(served_pid, released_pid, "FIFO dispatch to the freed worker");

    drop(s2);
    drop(client2);
}

#[test]
fn test_s3_spawn_failure() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    ts.spawner.fail_spawns.store(true, Ordering::Relaxed);
    let err = client.get(&app_options("/a")).unwrap_err();
    match err {
        PoolError::Spawn {
            message,
            error_page,
        } => {
            assert_eq!(message, "boom");
            assert!(error_page.is_none());
        }
        other => panic!("expected SpawnException, got {:?}", other),
    }
    assert_eq!(client.get_count().unwrap(), 0);
    assert!(
        client.connected(),
        "spawn failure must not drop the connection"
    );

    // The pool retries spawning on the next request.
    ts.spawner.fail_spawns.store(false, Ordering::Relaxed);
    let session = client.get(&app_options("/a")).expect("retry succeeds");
    assert_eq!(client.get_count().unwrap(), 1);
    drop(session);
}

#[test]
fn test_s4_idle_gc() {
    let config = PoolConfig {
        max: 4,
        max_per_app: 3,
        max_idle_time: Duration::from_secs(1),
        get_timeout: Duration::from_secs(5),
    };
    let ts = TestServer::start(config);
    let mut client = ts.client();

    let mut options = app_options("/a");
    options.min_processes = 1;
    options.max_processes = 3;

    let sessions: Vec<_> = (0..3).map(|_| client.get(&options).unwrap()).collect();
    assert_eq!(client.get_count().unwrap(), 3);
    drop(sessions);

    let deadline = Instant::now() + Duration::from_secs(6);
    while client.get_count().unwrap() != 1 && Instant::now() < deadline {
        ts.pool.wakeup_garbage_collector();
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(
        client.get_count().unwrap(),
        1,
        "idle workers above min_processes must be collected"
    );
}

#[test]
fn test_s5_auth_failure_preserves_connection() {
    let ts = TestServer::start(small_pool_config());

    let mut client = PoolClient::new();
    let err = client
        .connect(&ts.socket, USERNAME, b"wrong-password")
        .unwrap_err();
    assert!(matches!(err, PoolError::Security(_)));
    assert!(client.connected(), "auth failure must keep the connection");

    client
        .authenticate(USERNAME, PASSWORD)
        .expect("second auth attempt succeeds");
    assert_eq!(client.get_count().unwrap(), 0);
}

#[test]
fn test_s6_sessions_outlive_the_client_stub() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    let session = client.get(&app_options("/a")).expect("get");
    drop(client); // stub goes first

    // The session still works: it shares the channel the stub opened.
    echo_roundtrip(&session, b"still alive");
    assert_eq!(ts.pool.get_active(), 1);

    drop(session);
    let deadline = Instant::now() + Duration::from_secs(2);
    while ts.pool.get_active() != 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(ts.pool.get_active(), 0, "worker slot must be released");
}

#[test]
fn test_pool_limit_commands() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    client.set_max(8).unwrap();
    client.set_max_per_app(4).unwrap();
    client.set_max_idle_time(300).unwrap();
    assert_eq!(client.get_count().unwrap(), 0);
    assert!(client.get_spawn_server_pid().unwrap() > 0);
}

#[test]
fn test_disable_enable_process_commands() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    let session = client.get(&app_options("/a")).unwrap();
    let first_pid = session.pid();
    drop(session);

    assert!(client.disable_process(first_pid).unwrap());
    assert!(!client.disable_process(123_456).unwrap());

    // The reserved worker takes no sessions; a fresh one spawns.
    let session = client.get(&app_options("/a")).unwrap();
    assert_ne!(session.pid(), first_pid);
    assert_eq!(client.get_count().unwrap(), 2);
    drop(session);

    assert!(client.enable_process(first_pid).unwrap());
    let snapshot = client.inspect().unwrap();
    assert!(snapshot.contains("disabled=0"));
}

#[test]
fn test_clear_command() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    let session = client.get(&app_options("/a")).unwrap();
    assert_eq!(client.get_count().unwrap(), 1);

    client.clear().expect("clear");
    assert_eq!(client.get_count().unwrap(), 0);
    drop(session);
}

#[test]
fn test_inspect_snapshot() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    let session = client.get(&app_options("/a")).unwrap();
    let snapshot = client.inspect().expect("inspect");
    assert!(snapshot.contains("supergroup /a"));
    assert!(snapshot.contains("group /a"));
    assert!(snapshot.contains("sessions=1"));
    drop(session);
}

#[test]
fn test_session_discard_then_close_leaves_fd_open() {
    let ts = TestServer::start(small_pool_config());
    let mut client = ts.client();

    let mut session = client.get(&app_options("/a")).unwrap();
    let raw = {
        let fd = session.stream().expect("stream");
        fd.try_clone_to_owned().expect("clone")
    };
    session.discard_stream();
    session.close_stream().expect("close after discard is a no-op");
    assert!(session.stream().is_none());

    // The descriptor we cloned before the discard still works.
    let mut stream = UnixStream::from(raw);
    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

mod cli {
    //! Exit-code behavior of the server binary.

    use assert_cmd::Command;
    use predicates::prelude::*;

    fn procpool() -> Command {
        Command::cargo_bin("procpool").unwrap()
    }

    #[test]
    fn test_missing_password_is_config_error() {
        procpool()
            .args(["--socket", "/tmp/procpool-test.sock"])
            .env_remove("PROCPOOL_PASSWORD")
            .env_remove("PROCPOOL_PASSWORD_FILE")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("password"));
    }

    #[test]
    fn test_unbindable_socket_is_bind_error() {
        procpool()
            .args(["--socket", "/nonexistent-dir/pool.sock"])
            .env("PROCPOOL_PASSWORD", "secret")
            .assert()
            .code(2)
            .stderr(predicate::str::contains("cannot bind"));
    }

    #[test]
    fn test_help_exits_clean() {
        procpool()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--socket"));
    }
}
