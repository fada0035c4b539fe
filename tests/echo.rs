//! Integration tests: echo servers over real TCP and Unix sockets.
//!
//! Each test launches a spindle server on a background thread, connects
//! with std sockets, and verifies echoed bytes plus the open/close
//! bookkeeping after the server returns.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use spindle::{Action, Conn, ConnHandle, EventHandler, Options, OptionsBuilder, Server};

// ── Helpers ─────────────────────────────────────────────────────────

fn wait_bound(bound: &OnceLock<SocketAddr>) -> SocketAddr {
    for _ in 0..500 {
        if let Some(sa) = bound.get() {
            return *sa;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start");
}

fn connect_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("could not connect to {addr}");
}

/// Deterministic pseudo-random payload so runs are reproducible.
fn fill_payload(buf: &mut [u8], seed: &mut u64) {
    for b in buf.iter_mut() {
        *seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *b = (*seed >> 33) as u8;
    }
}

fn record_bound(server: &Server, bound: &OnceLock<SocketAddr>) {
    if let Some(sa) = server.local_addr().socket_addr() {
        bound.set(sa).ok();
    }
}

// ── Ten concurrent clients, ≥64 KiB each ───────────────────────────

struct EchoTen {
    bound: Arc<OnceLock<SocketAddr>>,
    connected: Arc<AtomicI32>,
    disconnected: Arc<AtomicI32>,
    nclients: i32,
}

impl EventHandler for EchoTen {
    fn on_init(&self, server: &Server) -> Action {
        record_bound(server, &self.bound);
        Action::None
    }

    fn on_opened(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        assert!(conn.local_addr().is_some());
        assert!(conn.remote_addr().is_some());
        self.connected.fetch_add(1, Ordering::SeqCst);
        (Some(Bytes::from_static(b"sweetness\r\n")), Action::None)
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (Some(Bytes::copy_from_slice(frame)), Action::None)
    }

    fn on_closed(&self, _conn: &mut Conn, _err: Option<&spindle::Error>) -> Action {
        let disconnected = self.disconnected.fetch_add(1, Ordering::SeqCst) + 1;
        if disconnected == self.nclients && self.connected.load(Ordering::SeqCst) == self.nclients
        {
            Action::Shutdown
        } else {
            Action::None
        }
    }
}

fn run_echo_ten(opts: Options) {
    let bound = Arc::new(OnceLock::new());
    let connected = Arc::new(AtomicI32::new(0));
    let disconnected = Arc::new(AtomicI32::new(0));
    let handler = EchoTen {
        bound: bound.clone(),
        connected: connected.clone(),
        disconnected: disconnected.clone(),
        nclients: 10,
    };

    let server = thread::spawn(move || spindle::serve(handler, "tcp://127.0.0.1:0", opts));
    let addr = wait_bound(&bound);

    let mut clients = Vec::new();
    for i in 0..10u64 {
        clients.push(thread::spawn(move || {
            let mut stream = connect_retry(addr);
            let mut header = [0u8; 11];
            stream.read_exact(&mut header).unwrap();
            assert_eq!(&header, b"sweetness\r\n");

            let mut seed = 0x9E3779B97F4A7C15u64 ^ i;
            let mut buf = vec![0u8; 8192];
            let mut echo = vec![0u8; 8192];
            // 9 rounds of 8 KiB — comfortably past 64 KiB per client.
            for _ in 0..9 {
                fill_payload(&mut buf, &mut seed);
                stream.write_all(&buf).unwrap();
                stream.read_exact(&mut echo).unwrap();
                assert_eq!(echo, buf, "echoed bytes differ");
            }
        }));
    }
    for c in clients {
        c.join().unwrap();
    }

    server.join().unwrap().expect("serve failed");
    assert_eq!(connected.load(Ordering::SeqCst), 10);
    assert_eq!(disconnected.load(Ordering::SeqCst), 10);
}

#[test]
fn echo_ten_clients_single_loop() {
    run_echo_ten(Options::default());
}

#[test]
fn echo_ten_clients_multicore_least_connections() {
    let opts = OptionsBuilder::new()
        .multicore(true)
        .tcp_nodelay(true)
        .load_balancing(spindle::LoadBalancing::LeastConnections)
        .build()
        .unwrap();
    run_echo_ten(opts);
}

#[test]
fn echo_ten_clients_reuse_port_source_hash() {
    let opts = OptionsBuilder::new()
        .num_event_loop(2)
        .reuse_port(true)
        .tcp_keepalive(Duration::from_secs(60))
        .load_balancing(spindle::LoadBalancing::SourceAddrHash)
        .build()
        .unwrap();
    run_echo_ten(opts);
}

// ── Unix-domain echo ────────────────────────────────────────────────

struct UnixEcho {
    ready: Arc<AtomicBool>,
}

impl EventHandler for UnixEcho {
    fn on_init(&self, server: &Server) -> Action {
        assert!(matches!(server.local_addr(), spindle::NetAddr::Unix(_)));
        self.ready.store(true, Ordering::SeqCst);
        Action::None
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (Some(Bytes::copy_from_slice(frame)), Action::None)
    }

    fn on_closed(&self, _conn: &mut Conn, _err: Option<&spindle::Error>) -> Action {
        Action::Shutdown
    }
}

#[test]
fn unix_socket_echo() {
    let path = std::env::temp_dir().join(format!("spindle-echo-{}.sock", std::process::id()));
    let proto_addr = format!("unix://{}", path.display());

    let ready = Arc::new(AtomicBool::new(false));
    let handler = UnixEcho {
        ready: ready.clone(),
    };
    let addr = proto_addr.clone();
    let server = thread::spawn(move || spindle::serve(handler, &addr, Options::default()));

    let mut stream = None;
    for _ in 0..200 {
        if ready.load(Ordering::SeqCst)
            && let Ok(s) = std::os::unix::net::UnixStream::connect(&path)
        {
            stream = Some(s);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let mut stream = stream.expect("could not connect to unix socket");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    stream.write_all(b"over the unix socket").unwrap();
    let mut echo = [0u8; 20];
    stream.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"over the unix socket");
    drop(stream);

    server.join().unwrap().expect("serve failed");
    assert!(!path.exists(), "socket file should be unlinked on stop");
}

// ── Asynchronous writes from a worker thread ────────────────────────

struct AsyncEcho {
    bound: Arc<OnceLock<SocketAddr>>,
}

impl EventHandler for AsyncEcho {
    fn on_init(&self, server: &Server) -> Action {
        record_bound(server, &self.bound);
        Action::None
    }

    fn react(&self, frame: &[u8], conn: &mut Conn) -> (Option<Bytes>, Action) {
        // Exercise the explicit consumption primitives; zero is a no-op.
        let _ = conn.buffer_len();
        conn.shift_n(0);

        let handle = conn.handle();
        let data = frame.to_vec();
        thread::spawn(move || {
            handle.async_write(data).unwrap();
        });
        (None, Action::None)
    }

    fn on_closed(&self, _conn: &mut Conn, _err: Option<&spindle::Error>) -> Action {
        Action::Shutdown
    }
}

#[test]
fn async_write_from_worker_thread() {
    let bound = Arc::new(OnceLock::new());
    let handler = AsyncEcho {
        bound: bound.clone(),
    };
    let server = thread::spawn(move || {
        spindle::serve(handler, "tcp://127.0.0.1:0", Options::default())
    });
    let addr = wait_bound(&bound);

    let mut stream = connect_retry(addr);
    for i in 0..20 {
        let msg = format!("async-{i}");
        stream.write_all(msg.as_bytes()).unwrap();
        let mut echo = vec![0u8; msg.len()];
        stream.read_exact(&mut echo).unwrap();
        assert_eq!(echo, msg.as_bytes());
    }
    drop(stream);

    server.join().unwrap().expect("serve failed");
}

// ── Close action: returned bytes, then EOF ──────────────────────────

struct CloseAfterReply {
    bound: Arc<OnceLock<SocketAddr>>,
    opened: Arc<AtomicI32>,
    closed: Arc<AtomicI32>,
}

impl EventHandler for CloseAfterReply {
    fn on_init(&self, server: &Server) -> Action {
        record_bound(server, &self.bound);
        Action::None
    }

    fn on_opened(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (None, Action::None)
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Bytes>, Action) {
        (Some(Bytes::copy_from_slice(frame)), Action::Close)
    }

    fn on_closed(&self, _conn: &mut Conn, _err: Option<&spindle::Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::Shutdown
    }
}

#[test]
fn close_action_flushes_reply_before_eof() {
    let bound = Arc::new(OnceLock::new());
    let opened = Arc::new(AtomicI32::new(0));
    let closed = Arc::new(AtomicI32::new(0));
    let handler = CloseAfterReply {
        bound: bound.clone(),
        opened: opened.clone(),
        closed: closed.clone(),
    };
    let server = thread::spawn(move || {
        spindle::serve(handler, "tcp://127.0.0.1:0", Options::default())
    });
    let addr = wait_bound(&bound);

    let mut stream = connect_retry(addr);
    stream.write_all(b"Hello World!").unwrap();
    let mut echo = [0u8; 12];
    stream.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"Hello World!");

    // The server initiated the close after flushing; next read is EOF.
    let mut extra = [0u8; 1];
    match stream.read(&mut extra) {
        Ok(0) => {}
        other => panic!("expected EOF after close action, got {other:?}"),
    }

    server.join().unwrap().expect("serve failed");
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

// ── Ticker-driven wake: empty frame reaches react ───────────────────

struct WakeOnTick {
    bound: Arc<OnceLock<SocketAddr>>,
    conn: Arc<Mutex<Option<ConnHandle>>>,
    woke_empty: Arc<AtomicBool>,
}

impl EventHandler for WakeOnTick {
    fn on_init(&self, server: &Server) -> Action {
        record_bound(server, &self.bound);
        Action::None
    }

    fn on_opened(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        *self.conn.lock().unwrap() = Some(conn.handle());
        (None, Action::None)
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Bytes>, Action) {
        if frame.is_empty() {
            self.woke_empty.store(true, Ordering::SeqCst);
        }
        (Some(Bytes::from_static(b"Waking up.")), Action::None)
    }

    fn tick(&self) -> (Duration, Action) {
        if let Some(handle) = self.conn.lock().unwrap().as_ref() {
            let _ = handle.wake();
        }
        (Duration::from_millis(50), Action::None)
    }

    fn on_closed(&self, _conn: &mut Conn, _err: Option<&spindle::Error>) -> Action {
        Action::Shutdown
    }
}

#[test]
fn ticker_wake_delivers_empty_frame() {
    let bound = Arc::new(OnceLock::new());
    let conn = Arc::new(Mutex::new(None));
    let woke_empty = Arc::new(AtomicBool::new(false));
    let handler = WakeOnTick {
        bound: bound.clone(),
        conn: conn.clone(),
        woke_empty: woke_empty.clone(),
    };
    let opts = OptionsBuilder::new().ticker(true).build().unwrap();
    let server = thread::spawn(move || spindle::serve(handler, "tcp://127.0.0.1:0", opts));
    let addr = wait_bound(&bound);

    // Connect and send nothing: only a wake can produce output.
    let mut stream = connect_retry(addr);
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"Waking up.");
    drop(stream);

    server.join().unwrap().expect("serve failed");
    assert!(woke_empty.load(Ordering::SeqCst));
}

// ── Context slot + single-thread ownership ──────────────────────────

struct ContextCheck {
    bound: Arc<OnceLock<SocketAddr>>,
    consistent: Arc<AtomicBool>,
}

impl ContextCheck {
    fn check(&self, conn: &Conn) {
        let owner = conn.context::<thread::ThreadId>().copied();
        if owner != Some(thread::current().id()) {
            self.consistent.store(false, Ordering::SeqCst);
        }
    }
}

impl EventHandler for ContextCheck {
    fn on_init(&self, server: &Server) -> Action {
        record_bound(server, &self.bound);
        Action::None
    }

    fn on_opened(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        conn.set_context(thread::current().id());
        (None, Action::None)
    }

    fn react(&self, frame: &[u8], conn: &mut Conn) -> (Option<Bytes>, Action) {
        self.check(conn);
        (Some(Bytes::copy_from_slice(frame)), Action::None)
    }

    fn on_closed(&self, conn: &mut Conn, _err: Option<&spindle::Error>) -> Action {
        self.check(conn);
        Action::Shutdown
    }
}

#[test]
fn context_survives_and_loop_ownership_holds() {
    let bound = Arc::new(OnceLock::new());
    let consistent = Arc::new(AtomicBool::new(true));
    let handler = ContextCheck {
        bound: bound.clone(),
        consistent: consistent.clone(),
    };
    let opts = OptionsBuilder::new().multicore(true).build().unwrap();
    let server = thread::spawn(move || spindle::serve(handler, "tcp://127.0.0.1:0", opts));
    let addr = wait_bound(&bound);

    let mut stream = connect_retry(addr);
    for _ in 0..5 {
        stream.write_all(b"ping").unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"ping");
    }
    drop(stream);

    server.join().unwrap().expect("serve failed");
    assert!(
        consistent.load(Ordering::SeqCst),
        "a callback ran on a different thread than on_opened"
    );
}
