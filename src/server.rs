//! Server context, startup and shutdown coordination.
//!
//! `Server::start` binds the listener, creates the completion queue and
//! spawns one acceptor thread plus the worker pool. `Server::shutdown`
//! stops them with one sentinel per worker, then drains whatever is still
//! in flight.

use crate::config::{Config, ConnectionPolicy};
use crate::consumer::PayloadConsumer;
use crate::error::StartupError;
use crate::runtime::acceptor::Acceptor;
use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::op::OpLedger;
use crate::runtime::uring::event_loop::report_exit;
use crate::runtime::uring::{spawn_workers, Completion, CompletionQueue, WorkerExit};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Attempts to post a sentinel while the submission queue is full.
const SENTINEL_RETRIES: usize = 100;

/// State shared by the acceptor and every worker.
pub struct ServerContext {
    pub queue: CompletionQueue,
    pub registry: Arc<ConnectionRegistry>,
    pub ledger: Arc<OpLedger>,
    pub consumer: Arc<dyn PayloadConsumer>,
    pub policy: ConnectionPolicy,
    pub buffer_size: usize,
    pub max_wait_failures: u32,
    shutdown: AtomicBool,
}

impl ServerContext {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Post `count` sentinels, retrying while the submission queue is full.
    pub fn post_sentinels(&self, count: usize) {
        for _ in 0..count {
            let mut attempts = 0;
            while let Err(e) = self.queue.post_sentinel() {
                attempts += 1;
                if attempts >= SENTINEL_RETRIES {
                    error!(error = %e, "Failed to post shutdown sentinel");
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Outcome of `Server::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that stopped by observing a sentinel.
    pub workers_stopped: usize,
    /// In-flight operations completed and freed during the drain.
    pub drained: u64,
    /// Operations still in flight when the drain timed out.
    pub abandoned: u64,
}

/// A running server.
pub struct Server {
    ctx: Arc<ServerContext>,
    local_addr: SocketAddr,
    waker: Arc<mio::Waker>,
    acceptor: JoinHandle<()>,
    workers: Vec<JoinHandle<WorkerExit>>,
    drain_timeout: Duration,
}

impl Server {
    /// Bind, create the completion queue and start all threads.
    pub fn start(
        config: &Config,
        consumer: Arc<dyn PayloadConsumer>,
    ) -> Result<Self, StartupError> {
        let listener = create_listener(config.listen, config.backlog)?;
        let local_addr = listener.local_addr().map_err(StartupError::Socket)?;

        let queue = CompletionQueue::new(config.ring_size).map_err(StartupError::CompletionQueue)?;

        let ctx = Arc::new(ServerContext {
            queue,
            registry: ConnectionRegistry::new(config.max_connections),
            ledger: OpLedger::new(),
            consumer,
            policy: config.policy,
            buffer_size: config.buffer_size,
            max_wait_failures: config.max_wait_failures,
            shutdown: AtomicBool::new(false),
        });

        let (acceptor, waker) = Acceptor::new(listener).map_err(StartupError::Runtime)?;
        let workers = spawn_workers(&ctx, config.workers).map_err(StartupError::Runtime)?;

        let acceptor_ctx = Arc::clone(&ctx);
        let acceptor = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run(&acceptor_ctx));

        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(e) => {
                ctx.shutdown.store(true, Ordering::Release);
                ctx.post_sentinels(workers.len());
                for handle in workers {
                    let _ = handle.join();
                }
                return Err(StartupError::Runtime(e));
            }
        };

        info!(
            addr = %local_addr,
            workers = config.workers,
            max_connections = ctx.registry.capacity(),
            buffer_size = config.buffer_size,
            ring_size = config.ring_size,
            policy = ?config.policy,
            "Server started"
        );

        Ok(Self {
            ctx,
            local_addr,
            waker,
            acceptor,
            workers,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Descriptor allocation counters.
    pub fn ledger(&self) -> &Arc<OpLedger> {
        &self.ctx.ledger
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Stop accepting, stop every worker and drain in-flight operations.
    pub fn shutdown(self) -> ShutdownReport {
        info!(workers = self.workers.len(), "Shutting down");

        self.ctx.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }

        self.ctx.post_sentinels(self.workers.len());

        if self.acceptor.join().is_err() {
            error!("Acceptor panicked");
        }

        let workers_stopped = self
            .workers
            .into_iter()
            .enumerate()
            .map(|(worker_id, handle)| report_exit(worker_id, handle.join()))
            .filter(|stopped| *stopped)
            .count();

        let (drained, abandoned) = drain(&self.ctx, self.drain_timeout);

        ShutdownReport {
            workers_stopped,
            drained,
            abandoned,
        }
    }
}

/// Force in-flight operations to complete and free their descriptors
/// without handing any data to the consumer.
fn drain(ctx: &ServerContext, timeout: Duration) -> (u64, u64) {
    let live = ctx.registry.shutdown_all();
    let deadline = Instant::now() + timeout;
    let mut drained = 0u64;

    while ctx.ledger.outstanding() > 0 {
        match ctx.queue.try_next() {
            Some(Completion::Op { op, .. }) => {
                op.retire();
                drained += 1;
            }
            Some(_) => {}
            None => {
                if Instant::now() >= deadline {
                    break;
                }
                ctx.queue.flush();
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    let abandoned = ctx.ledger.outstanding();
    if abandoned > 0 {
        warn!(abandoned, "Abandoning in-flight operations");
    }
    debug!(live, drained, "Drain finished");

    (drained, abandoned)
}

/// Create the listening socket. Each step maps to its own startup error.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, StartupError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(StartupError::Socket)?;

    socket.set_reuse_address(true).map_err(StartupError::Socket)?;
    socket.bind(&addr.into()).map_err(StartupError::Bind)?;
    socket.listen(backlog).map_err(StartupError::Listen)?;
    socket.set_nonblocking(true).map_err(StartupError::Socket)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerKind;
    use crate::consumer::{EchoConsumer, PrintConsumer};
    use crate::runtime::connection::ConnectionId;
    use bytes::Bytes;
    use socket2::SockRef;
    use std::collections::HashSet;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Forwards every payload to a channel.
    struct Recorder {
        tx: Mutex<Sender<(ConnectionId, Vec<u8>)>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, Receiver<(ConnectionId, Vec<u8>)>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }
    }

    impl PayloadConsumer for Recorder {
        fn consume(&self, conn: ConnectionId, data: &[u8]) -> Option<Bytes> {
            let _ = self.tx.lock().unwrap().send((conn, data.to_vec()));
            None
        }
    }

    /// Replies with a fixed payload regardless of input.
    struct Banner(Bytes);

    impl PayloadConsumer for Banner {
        fn consume(&self, _conn: ConnectionId, _data: &[u8]) -> Option<Bytes> {
            Some(self.0.clone())
        }
    }

    fn test_config(workers: usize, policy: ConnectionPolicy) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            workers,
            backlog: 128,
            max_connections: 1024,
            buffer_size: 1024,
            ring_size: 256,
            max_wait_failures: 16,
            policy,
            consumer: ConsumerKind::Print,
            drain_timeout: Duration::from_secs(2),
            log_level: "info".to_string(),
        }
    }

    fn start_or_skip(config: &Config, consumer: Arc<dyn PayloadConsumer>) -> Option<Server> {
        match Server::start(config, consumer) {
            Ok(server) => Some(server),
            Err(StartupError::CompletionQueue(e)) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
            Err(e) => panic!("server failed to start: {}", e),
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_hello_is_consumed_once_then_closed() {
        let (recorder, rx) = Recorder::new();
        let config = test_config(2, ConnectionPolicy::Close);
        let Some(server) = start_or_skip(&config, recorder) else { return };

        let mut client = connect(server.local_addr());
        client.write_all(b"hello").unwrap();

        let (_, data) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(data.len(), 5);
        assert_eq!(data, b"hello");

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.outstanding() == 0));
        assert_eq!(ledger.allocated(), 1);

        let report = server.shutdown();
        assert_eq!(report.workers_stopped, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[test]
    fn test_connect_then_disconnect_frees_descriptor() {
        let (recorder, rx) = Recorder::new();
        let config = test_config(1, ConnectionPolicy::Close);
        let Some(server) = start_or_skip(&config, recorder) else { return };

        let client = connect(server.local_addr());
        drop(client);

        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.allocated() == 1 && ledger.outstanding() == 0));
        assert!(wait_until(|| server.connections() == 0));
        assert!(rx.try_recv().is_err());

        let report = server.shutdown();
        assert_eq!(report.workers_stopped, 1);
        assert_eq!(report.drained, 0);
    }

    #[test]
    fn test_concurrent_clients_keep_payloads_isolated() {
        const CLIENTS: usize = 50;

        let (recorder, rx) = Recorder::new();
        let config = test_config(4, ConnectionPolicy::Close);
        let Some(server) = start_or_skip(&config, recorder) else { return };
        let addr = server.local_addr();

        let clients: Vec<_> = (0..CLIENTS)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = connect(addr);
                    client.write_all(format!("client-{:02}", i).as_bytes()).unwrap();
                    let mut rest = Vec::new();
                    client.read_to_end(&mut rest).unwrap();
                    rest
                })
            })
            .collect();

        for client in clients {
            assert!(client.join().unwrap().is_empty());
        }

        let mut seen = HashSet::new();
        for _ in 0..CLIENTS {
            let (_, data) = rx.recv_timeout(TIMEOUT).unwrap();
            assert!(seen.insert(String::from_utf8(data).unwrap()));
        }
        let expected: HashSet<String> = (0..CLIENTS).map(|i| format!("client-{:02}", i)).collect();
        assert_eq!(seen, expected);

        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.outstanding() == 0));
        assert_eq!(ledger.allocated(), CLIENTS as u64);

        let report = server.shutdown();
        assert_eq!(report.workers_stopped, 4);
    }

    #[test]
    fn test_reset_connections_free_descriptors() {
        const CLIENTS: usize = 20;

        let (recorder, rx) = Recorder::new();
        let config = test_config(2, ConnectionPolicy::Close);
        let Some(server) = start_or_skip(&config, recorder) else { return };

        let clients: Vec<_> = (0..CLIENTS).map(|_| connect(server.local_addr())).collect();
        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.outstanding() == CLIENTS as u64));

        for client in clients {
            SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
            drop(client);
        }

        assert!(wait_until(|| ledger.outstanding() == 0));
        assert_eq!(ledger.allocated(), CLIENTS as u64);
        assert_eq!(ledger.freed(), CLIENTS as u64);
        assert!(wait_until(|| server.connections() == 0));
        assert!(rx.try_recv().is_err());

        // Workers are still serving after the error completions.
        let mut client = connect(server.local_addr());
        client.write_all(b"after").unwrap();
        let (_, data) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(data, b"after");

        let report = server.shutdown();
        assert_eq!(report.workers_stopped, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[test]
    fn test_shutdown_with_reads_in_flight() {
        let config = test_config(2, ConnectionPolicy::Close);
        let Some(server) = start_or_skip(&config, Arc::new(PrintConsumer)) else { return };

        let mut clients: Vec<_> = (0..10).map(|_| connect(server.local_addr())).collect();

        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.outstanding() == 10));

        let report = server.shutdown();
        assert_eq!(report.workers_stopped, 2);
        assert_eq!(report.drained, 10);
        assert_eq!(report.abandoned, 0);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.freed(), 10);

        let mut buf = [0u8; 1];
        for client in clients.iter_mut() {
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }
    }

    #[test]
    fn test_every_worker_observes_one_sentinel() {
        let config = test_config(4, ConnectionPolicy::Close);
        let Some(server) = start_or_skip(&config, Arc::new(PrintConsumer)) else { return };

        let report = server.shutdown();
        assert_eq!(
            report,
            ShutdownReport {
                workers_stopped: 4,
                drained: 0,
                abandoned: 0,
            }
        );
    }

    #[test]
    fn test_keep_alive_echo() {
        let config = test_config(2, ConnectionPolicy::KeepAlive);
        let Some(server) = start_or_skip(&config, Arc::new(EchoConsumer)) else { return };

        let mut client = connect(server.local_addr());
        for message in [&b"ping"[..], &b"pong"[..]] {
            client.write_all(message).unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf[..], message);
        }
        assert_eq!(server.connections(), 1);

        drop(client);
        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.outstanding() == 0));
        assert!(wait_until(|| server.connections() == 0));
        assert_eq!(ledger.allocated(), 1);

        server.shutdown();
    }

    #[test]
    fn test_reply_larger_than_buffer_is_written_in_chunks() {
        let reply: Bytes = (0..100u8).collect::<Vec<_>>().into();
        let mut config = test_config(1, ConnectionPolicy::Close);
        config.buffer_size = 8;
        let Some(server) = start_or_skip(&config, Arc::new(Banner(reply.clone()))) else {
            return;
        };

        let mut client = connect(server.local_addr());
        client.write_all(b"go").unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, reply.to_vec());

        let ledger = Arc::clone(server.ledger());
        assert!(wait_until(|| ledger.outstanding() == 0));
        server.shutdown();
    }

    #[test]
    fn test_connections_over_capacity_are_closed() {
        let mut config = test_config(1, ConnectionPolicy::Close);
        config.max_connections = 1;
        let Some(server) = start_or_skip(&config, Arc::new(PrintConsumer)) else { return };

        let _held = connect(server.local_addr());
        assert!(wait_until(|| server.connections() == 1));

        let mut rejected = connect(server.local_addr());
        let mut buf = [0u8; 1];
        assert_eq!(rejected.read(&mut buf).unwrap(), 0);
        assert_eq!(server.ledger().allocated(), 1);

        let report = server.shutdown();
        assert_eq!(report.drained, 1);
    }

    #[test]
    fn test_bind_failure_has_its_own_exit_code() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(1, ConnectionPolicy::Close);
        config.listen = taken.local_addr().unwrap();

        match Server::start(&config, Arc::new(PrintConsumer)) {
            Err(e @ StartupError::Bind(_)) => assert_eq!(e.exit_code(), 4),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("bound an address that is in use"),
        }
    }
}
