//! The exmdb client: per-remote pools of idle control connections, a
//! keepalive scanner, one notification-reader thread per remote, and an
//! in-process short-circuit for prefixes served by the local engine.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::store::notify::DbNotify;
use crate::store::Engine;
use crate::types::{EcError, EcResult};

use super::notify::NotifyDatagram;
use super::request::{ConnectRequest, ListenRequest, Request, StoreRequest};
use super::response::Response;
use super::{read_frame, write_frame, ResponseCode, SOCKET_TIMEOUT};

/// Keepalive probe window: connections idle longer than
/// `SOCKET_TIMEOUT - PING_MARGIN` get pinged.
const PING_MARGIN: Duration = Duration::from_secs(3);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Callback invoked for every notification datagram received from a
/// remote: `(store dir, subscription id, change)`.
pub type EventProc = Box<dyn Fn(&std::path::Path, u32, &DbNotify) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub private: bool,
    /// Prefix served in-process; never opens sockets.
    pub local: bool,
}

struct PooledConn {
    sock: TcpStream,
    last_time: Instant,
}

struct ServerState {
    config: RemoteConfig,
    conns: VecDeque<PooledConn>,
    active_handles: u32,
}

struct Shared {
    servers: Mutex<Vec<ServerState>>,
    slot_available: Condvar,
    remote_id: String,
    conn_max: u32,
    notify_threads_max: u32,
    rpc_timeout: Option<Duration>,
    local_engine: RwLock<Option<Arc<Engine>>>,
    event_proc: RwLock<Option<EventProc>>,
    stop: AtomicBool,
}

/// Process-global exmdb client. Owns the scanner and reader threads; both
/// stop on drop.
pub struct ExmdbClient {
    shared: Arc<Shared>,
    pinger: Mutex<Option<std::thread::JoinHandle<()>>>,
    agents: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

static GLOBAL: OnceCell<ExmdbClient> = OnceCell::new();

/// Install the process-wide client instance.
pub fn set_global(client: ExmdbClient) -> Result<(), ExmdbClient> {
    GLOBAL.set(client)
}

pub fn global() -> Option<&'static ExmdbClient> {
    GLOBAL.get()
}

impl ExmdbClient {
    pub fn new(conn_max: u32, notify_threads_max: u32, rpc_timeout: Option<Duration>) -> Self {
        let remote_id = format!("{}.{}", std::process::id(), uuid::Uuid::new_v4().simple());
        Self {
            shared: Arc::new(Shared {
                servers: Mutex::new(Vec::new()),
                slot_available: Condvar::new(),
                remote_id,
                conn_max,
                notify_threads_max,
                rpc_timeout,
                local_engine: RwLock::new(None),
                event_proc: RwLock::new(None),
                stop: AtomicBool::new(false),
            }),
            pinger: Mutex::new(None),
            agents: Mutex::new(Vec::new()),
        }
    }

    /// Allow direct in-process dispatch for prefixes flagged `local`.
    pub fn set_local_engine(&self, engine: Arc<Engine>) {
        *self.shared.local_engine.write().unwrap_or_else(|e| e.into_inner()) = Some(engine);
    }

    pub fn set_event_proc(&self, proc_: EventProc) {
        *self.shared.event_proc.write().unwrap_or_else(|e| e.into_inner()) = Some(proc_);
    }

    pub fn remote_id(&self) -> &str {
        &self.shared.remote_id
    }

    /// Register the server list and start the keepalive scanner and the
    /// notification readers for remote entries.
    pub fn run(&self, servers: Vec<RemoteConfig>) -> EcResult<()> {
        {
            let mut list = lock(&self.shared.servers);
            for config in servers {
                if !config.local && self.shared.conn_max == 0 {
                    error!(
                        "remote prefix {} configured but connection count is 0",
                        config.prefix
                    );
                    return Err(EcError::InvalidParam);
                }
                list.push(ServerState { config, conns: VecDeque::new(), active_handles: 0 });
            }
        }
        if self.shared.conn_max == 0 {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let pinger = std::thread::Builder::new()
            .name("exmdbcl/scan".into())
            .spawn(move || {
                while !shared.stop.load(Ordering::Relaxed) {
                    ping_idle_connections(&shared);
                    std::thread::sleep(Duration::from_secs(1));
                }
            })
            .map_err(|_| EcError::InsufficientResources)?;
        *lock(&self.pinger) = Some(pinger);

        // one reader per remote, capped by notify_threads_max
        if self.shared.event_proc.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            let remotes: Vec<RemoteConfig> = lock(&self.shared.servers)
                .iter()
                .filter(|s| !s.config.local)
                .take(self.shared.notify_threads_max as usize)
                .map(|s| s.config.clone())
                .collect();
            let mut agents = lock(&self.agents);
            for config in remotes {
                let shared = Arc::clone(&self.shared);
                let handle = std::thread::Builder::new()
                    .name(format!("exmdbcl/ntfy/{}", config.host))
                    .spawn(move || notification_reader(&shared, &config))
                    .map_err(|_| EcError::InsufficientResources)?;
                agents.push(handle);
            }
        }
        Ok(())
    }

    /// Is `dir` handled by a local (in-process) prefix?
    pub fn is_local(&self, dir: &str) -> Option<bool> {
        self.prefix_info(dir).map(|(local, _)| local)
    }

    /// `(local, private)` flags of the prefix serving `dir`.
    pub fn prefix_info(&self, dir: &str) -> Option<(bool, bool)> {
        lock(&self.shared.servers)
            .iter()
            .find(|s| dir.starts_with(&s.config.prefix))
            .map(|s| (s.config.local, s.config.private))
    }

    /// Execute one store verb against the store owning `dir`.
    pub fn call(&self, dir: &str, body: StoreRequest) -> EcResult<Response> {
        let (local, _private) = {
            let servers = lock(&self.shared.servers);
            let server = servers
                .iter()
                .find(|s| dir.starts_with(&s.config.prefix))
                .ok_or(EcError::WrongServer)?;
            (server.config.local, server.config.private)
        };
        if local {
            let engine = self
                .shared
                .local_engine
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or(EcError::NotInitialized)?;
            return super::server::dispatch(&engine, dir, body);
        }
        self.call_remote(dir, body)
    }

    fn call_remote(&self, dir: &str, body: StoreRequest) -> EcResult<Response> {
        let call_id = body.call_id();
        let request = Request::Store { dir: dir.to_owned(), body };
        let mut holder = self.get_connection(dir)?;

        let run = |sock: &mut TcpStream| -> EcResult<Response> {
            write_frame(sock, &request.encode())?;
            sock.set_read_timeout(self.shared.rpc_timeout)?;
            let mut code = [0u8; 1];
            sock.read_exact(&mut code)?;
            match ResponseCode::from_u8(code[0]) {
                ResponseCode::Success => {}
                ResponseCode::BadSwitch => return Err(EcError::NotSupported),
                ResponseCode::DispatchError => {
                    let mut len_buf = [0u8; 4];
                    sock.read_exact(&mut len_buf)?;
                    if u32::from_le_bytes(len_buf) != 4 {
                        return Err(EcError::RpcFormat);
                    }
                    let mut ec = [0u8; 4];
                    sock.read_exact(&mut ec)?;
                    return Err(EcError::from_code(u32::from_le_bytes(ec)));
                }
                other => {
                    warn!("rpc to {dir} failed: {}", other.strerror());
                    return Err(EcError::Network);
                }
            }
            let mut len_buf = [0u8; 4];
            sock.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            sock.read_exact(&mut payload)?;
            Response::decode(call_id, &payload)
        };

        match run(&mut holder.sock) {
            Ok(resp) => {
                holder.give_back();
                Ok(resp)
            }
            // transport failures poison the connection; it dies with the holder
            Err(e @ (EcError::Network | EcError::RpcFormat)) => Err(e),
            // in-band refusals (bad_switch, dispatch errors) leave it aligned
            Err(other) => {
                holder.give_back();
                Err(other)
            }
        }
    }

    /// Pop an idle connection for `dir`, or open a new one. Blocks while
    /// the per-remote handle budget is exhausted.
    fn get_connection(&self, dir: &str) -> EcResult<ConnHolder> {
        let shared = &self.shared;
        let mut servers = lock(&shared.servers);
        let idx = servers
            .iter()
            .position(|s| dir.starts_with(&s.config.prefix))
            .ok_or(EcError::WrongServer)?;
        loop {
            // discard pooled connections with pending bytes or dead peers
            while let Some(conn) = servers[idx].conns.pop_front() {
                if socket_is_idle(&conn.sock) {
                    servers[idx].active_handles += 1;
                    return Ok(ConnHolder::new(Arc::clone(shared), idx, conn.sock));
                }
                // dropped: the server hung up or left stray bytes
            }
            if servers[idx].active_handles < shared.conn_max {
                servers[idx].active_handles += 1;
                let config = servers[idx].config.clone();
                drop(servers);
                match connect_control(shared, &config) {
                    Ok(sock) => return Ok(ConnHolder::new(Arc::clone(shared), idx, sock)),
                    Err(e) => {
                        let mut servers = lock(&shared.servers);
                        servers[idx].active_handles -= 1;
                        shared.slot_available.notify_one();
                        drop(servers);
                        return Err(e);
                    }
                }
            }
            debug!("connection budget to {} exhausted; waiting", servers[idx].config.prefix);
            servers = shared
                .slot_available
                .wait(servers)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(h) = lock(&self.pinger).take() {
            let _ = h.join();
        }
        for h in lock(&self.agents).drain(..) {
            let _ = h.join();
        }
        let mut servers = lock(&self.shared.servers);
        for server in servers.iter_mut() {
            server.conns.clear();
        }
    }
}

impl Drop for ExmdbClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// RAII wrapper: gives the connection back to the pool unless it was lost.
struct ConnHolder {
    shared: Arc<Shared>,
    idx: usize,
    sock: TcpStream,
    give_back: bool,
}

impl ConnHolder {
    fn new(shared: Arc<Shared>, idx: usize, sock: TcpStream) -> Self {
        Self { shared, idx, sock, give_back: false }
    }

    fn give_back(&mut self) {
        self.give_back = true;
    }
}

impl Drop for ConnHolder {
    fn drop(&mut self) {
        let mut servers = lock(&self.shared.servers);
        let server = &mut servers[self.idx];
        server.active_handles = server.active_handles.saturating_sub(1);
        if self.give_back {
            if let Ok(sock) = self.sock.try_clone() {
                server.conns.push_back(PooledConn { sock, last_time: Instant::now() });
            }
        }
        self.shared.slot_available.notify_one();
    }
}

/// No readable bytes pending means the connection is reusable.
fn socket_is_idle(sock: &TcpStream) -> bool {
    sock.set_nonblocking(true).is_ok() && {
        let mut probe = [0u8; 1];
        let idle = match sock.peek(&mut probe) {
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            // readable data or EOF both disqualify it
            _ => false,
        };
        let _ = sock.set_nonblocking(false);
        idle
    }
}

/// Open a control connection and run the connect handshake.
fn connect_control(shared: &Shared, config: &RemoteConfig) -> EcResult<TcpStream> {
    let mut sock = open_socket(config)?;
    let request = Request::Connect(ConnectRequest {
        prefix: config.prefix.clone(),
        remote_id: shared.remote_id.clone(),
        b_private: config.private,
    });
    write_frame(&mut sock, &request.encode())?;
    finish_handshake(&mut sock, config)?;
    Ok(sock)
}

fn open_socket(config: &RemoteConfig) -> EcResult<TcpStream> {
    let addr = format!("{}:{}", config.host, config.port);
    let sock = addr
        .parse::<std::net::SocketAddr>()
        .map_err(|_| EcError::InvalidParam)
        .and_then(|a| {
            TcpStream::connect_timeout(&a, SOCKET_TIMEOUT).map_err(EcError::from)
        })
        .or_else(|_| TcpStream::connect(&addr).map_err(EcError::from))?;
    sock.set_nodelay(true)?;
    Ok(sock)
}

fn finish_handshake(sock: &mut TcpStream, config: &RemoteConfig) -> EcResult<()> {
    sock.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    let mut code = [0u8; 1];
    sock.read_exact(&mut code)?;
    let code = ResponseCode::from_u8(code[0]);
    if code != ResponseCode::Success {
        error!(
            "connect to [{}]:{}/{} refused: {}",
            config.host,
            config.port,
            config.prefix,
            code.strerror()
        );
        return Err(EcError::Network);
    }
    let mut rest = [0u8; 4];
    sock.read_exact(&mut rest)?;
    if rest != [0u8; 4] {
        error!(
            "response format error during connect to [{}]:{}/{}",
            config.host, config.port, config.prefix
        );
        return Err(EcError::RpcFormat);
    }
    Ok(())
}

/// One pass of the keepalive scanner: ping everything close to the idle
/// limit, return survivors to their pools.
fn ping_idle_connections(shared: &Shared) {
    let threshold = SOCKET_TIMEOUT - PING_MARGIN;
    let mut batch: Vec<(usize, PooledConn)> = Vec::new();
    {
        let mut servers = lock(&shared.servers);
        for (idx, server) in servers.iter_mut().enumerate() {
            let mut keep = VecDeque::new();
            while let Some(conn) = server.conns.pop_front() {
                if conn.last_time.elapsed() >= threshold {
                    batch.push((idx, conn));
                } else {
                    keep.push_back(conn);
                }
            }
            server.conns = keep;
        }
    }
    if shared.stop.load(Ordering::Relaxed) {
        return;
    }
    for (idx, mut conn) in batch {
        let alive = write_frame(&mut conn.sock, &[]).is_ok() && {
            let mut code = [0u8; 1];
            conn.sock.set_read_timeout(Some(DEFAULT_PING_TIMEOUT)).is_ok()
                && conn.sock.read_exact(&mut code).is_ok()
                && ResponseCode::from_u8(code[0]) == ResponseCode::Success
        };
        if alive {
            conn.last_time = Instant::now();
            lock(&shared.servers)[idx].conns.push_back(conn);
        }
        // dead connections are simply dropped; reconnects are transparent
    }
}

/// Notification reader: keeps one listen channel to the remote, feeding
/// the registered event proc; reconnects after errors.
fn notification_reader(shared: &Arc<Shared>, config: &RemoteConfig) {
    while !shared.stop.load(Ordering::Relaxed) {
        match notification_session(shared, config) {
            Ok(()) => return,
            Err(e) => {
                debug!("notification channel to {} lost: {e}; reconnecting", config.host);
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
}

fn notification_session(shared: &Arc<Shared>, config: &RemoteConfig) -> EcResult<()> {
    let mut sock = open_socket(config)?;
    let request = Request::ListenNotification(ListenRequest {
        remote_id: shared.remote_id.clone(),
    });
    write_frame(&mut sock, &request.encode())?;
    finish_handshake(&mut sock, config)?;
    info!("notification channel to [{}]:{} up", config.host, config.port);

    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let payload = read_frame(&mut sock, Some(SOCKET_TIMEOUT))?;
        if payload.is_empty() {
            sock.write_all(&[ResponseCode::Success as u8])?;
            continue;
        }
        match NotifyDatagram::decode(&payload) {
            Ok(dg) => {
                sock.write_all(&[ResponseCode::Success as u8])?;
                let proc_ = shared.event_proc.read().unwrap_or_else(|e| e.into_inner());
                if let Some(cb) = &*proc_ {
                    let dir = PathBuf::from(&dg.dir);
                    for sub_id in &dg.sub_ids {
                        cb(&dir, *sub_id, &dg.notify);
                    }
                }
            }
            Err(_) => {
                sock.write_all(&[ResponseCode::PullError as u8])?;
                return Err(EcError::RpcFormat);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{schema, Limits};

    fn local_client() -> (tempfile::TempDir, ExmdbClient) {
        let tmp = tempfile::tempdir().unwrap();
        schema::provision(tmp.path(), "u@example.com", true).unwrap();
        let client = ExmdbClient::new(2, 0, None);
        client.set_local_engine(Engine::new(Limits::default()));
        client
            .run(vec![RemoteConfig {
                host: String::new(),
                port: 0,
                prefix: tmp.path().display().to_string(),
                private: true,
                local: true,
            }])
            .unwrap();
        (tmp, client)
    }

    #[test]
    fn local_short_circuit() {
        let (tmp, client) = local_client();
        let dir = tmp.path().display().to_string();
        assert_eq!(client.is_local(&dir), Some(true));
        let resp = client.call(&dir, StoreRequest::PingStore).unwrap();
        assert_eq!(resp, Response::Unit);
        let resp = client
            .call(
                &dir,
                StoreRequest::CheckFolderId { folder_id: crate::types::private_fid::INBOX },
            )
            .unwrap();
        assert_eq!(resp, Response::Bool(true));
    }

    #[test]
    fn unknown_prefix_is_wrong_server() {
        let (_tmp, client) = local_client();
        assert_eq!(
            client.call("/nonexistent/prefix", StoreRequest::PingStore).unwrap_err(),
            EcError::WrongServer
        );
    }
}
