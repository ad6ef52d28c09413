//! Server pools: one listening endpoint plus its backend fleet.

use crate::config::{PoolConfig, ServerConfig};
use crate::dist::{BuildSlot, Continuum, DistType};
use crate::driver::{ConnId, Driver, SockInfo};
use crate::error::Error;
use crate::hashkit::HashType;
use crate::metrics;
use crate::server::{Server, ServerConnection};
use bytes::{Bytes, BytesMut};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::net::ToSocketAddrs;
use tracing::{debug, warn};

/// Process-unique pool identity, stable across reload windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

/// Where a pool stands in the hot-reload protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    /// Steady state; accepts clients, routes traffic.
    OldAndActive,
    /// Matched to a replacement; about to stop accepting.
    OldToShutdown,
    /// Listener closed; existing clients still draining.
    OldDraining,
    /// Replacement pool waiting for its counterpart to drain.
    NewWaitForOld,
    /// Replacement fully active.
    New,
}

impl ReloadState {
    /// States that keep a reload window open.
    pub fn pending(self) -> bool {
        matches!(
            self,
            ReloadState::OldToShutdown | ReloadState::OldDraining | ReloadState::NewWaitForOld
        )
    }
}

/// A collection of backend servers, their continuum, and the client
/// connections being proxied to them.
pub struct ServerPool {
    pub id: PoolId,
    pub idx: u32,
    pub name: String,

    pub listen: SockInfo,
    pub backlog: u32,
    listener: Option<ConnId>,
    clients: Vec<ConnId>,

    servers: Vec<Server>,
    continuum: Continuum,
    nlive_server: u32,
    next_rebuild: u64,
    rebuild_pending: bool,

    hash: HashType,
    dist: DistType,
    hash_tag: Option<(u8, u8)>,
    rng: Xoshiro256PlusPlus,

    timeout_ms: u64,
    client_connections: u32,
    server_connections: u32,
    server_retry_timeout: u64,
    server_failure_limit: u32,
    auto_eject_hosts: bool,
    pub preconnect: bool,
    pub redis: bool,
    preamble: Vec<Bytes>,

    pub reload_state: ReloadState,
    pub counterpart: Option<PoolId>,
}

impl ServerPool {
    pub fn new(id: PoolId, idx: u32, config: &PoolConfig) -> Result<Self, Error> {
        let servers = config
            .servers
            .iter()
            .enumerate()
            .map(|(at, record)| Server::new(at as u32, &ServerConfig::parse(record)?))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pool = ServerPool {
            id,
            idx,
            name: config.name.clone(),
            listen: parse_listen(config)?,
            backlog: config.backlog,
            listener: None,
            clients: Vec::new(),
            servers,
            continuum: Continuum::default(),
            nlive_server: 0,
            next_rebuild: 0,
            rebuild_pending: false,
            hash: config.hash,
            dist: config.distribution,
            hash_tag: config.hash_tag_bytes()?,
            rng: Xoshiro256PlusPlus::seed_from_u64(id.0 as u64),
            timeout_ms: config.timeout,
            client_connections: config.client_connections,
            server_connections: config.server_connections,
            server_retry_timeout: config.server_retry_timeout * 1_000,
            server_failure_limit: config.server_failure_limit,
            auto_eject_hosts: config.auto_eject_hosts,
            preconnect: config.preconnect,
            redis: config.redis,
            preamble: build_preamble(config),
            reload_state: ReloadState::OldAndActive,
            counterpart: None,
        };
        pool.rebuild(0);
        Ok(pool)
    }

    // ── Distribution ────────────────────────────────────────────────

    /// Hash a key, honoring the configured hash-tag delimiters.
    pub fn hash_key(&self, key: &[u8]) -> u32 {
        self.hash.hash(self.tagged(key))
    }

    fn tagged<'k>(&self, key: &'k [u8]) -> &'k [u8] {
        let Some((open, close)) = self.hash_tag else {
            return key;
        };
        if let Some(start) = key.iter().position(|&b| b == open)
            && let Some(len) = key[start + 1..].iter().position(|&b| b == close)
        {
            return &key[start + 1..start + 1 + len];
        }
        key
    }

    /// The server slot a key maps to, without touching any connection.
    pub fn idx_for_key(&mut self, key: &[u8]) -> Result<u32, Error> {
        let hash = self.hash_key(key);
        self.continuum
            .dispatch(self.dist, hash, &mut self.rng)
            .ok_or(Error::NoServerAvailable)
    }

    /// Apply any pending or deadline-driven continuum rebuild.
    pub fn update(&mut self, now: u64) {
        if self.rebuild_pending || (self.next_rebuild != 0 && now >= self.next_rebuild) {
            self.rebuild(now);
        }
    }

    /// Request a rebuild at the next safe point. Idempotent.
    pub fn schedule_rebuild(&mut self) {
        self.rebuild_pending = true;
    }

    fn rebuild(&mut self, now: u64) {
        let slots: Vec<BuildSlot<'_>> = self
            .servers
            .iter()
            .map(|s| BuildSlot {
                name: &s.name,
                weight: s.weight,
                live: s.is_live(now),
            })
            .collect();
        let nlive = slots.iter().filter(|s| s.live).count() as u32;
        let continuum = Continuum::build(self.dist, &slots);

        self.continuum = continuum;
        self.nlive_server = nlive;
        // Wake again when the earliest ejected server becomes
        // probe-eligible, so it re-enters the distribution on time.
        self.next_rebuild = self
            .servers
            .iter()
            .filter(|s| s.next_retry > now)
            .map(|s| s.next_retry)
            .min()
            .unwrap_or(0);
        self.rebuild_pending = false;

        metrics::CONTINUUM_REBUILDS.increment();
        debug!(
            pool = %self.name,
            live = nlive,
            points = self.continuum.npoints(),
            "continuum rebuilt"
        );
    }

    // ── Key → connection ────────────────────────────────────────────

    /// Resolve a key to a server connection: hash, continuum lookup,
    /// liveness/probe gate, connection selection. Returns the server
    /// slot, the connection, and whether the connection was created by
    /// this call.
    pub fn conn_for_key(
        &mut self,
        driver: &mut dyn Driver,
        key: &[u8],
        now: u64,
    ) -> Result<(u32, ConnId, bool), Error> {
        self.update(now);
        let idx = self.idx_for_key(key)?;
        self.admit_server(idx, now)?;
        let (conn, created) = self.server_conn(driver, idx)?;
        Ok((idx, conn, created))
    }

    /// Gate a request on the chosen server's health: ejected servers
    /// are refused, and a server past its retry deadline admits exactly
    /// one request as the probe.
    pub fn admit_server(&mut self, idx: u32, now: u64) -> Result<(), Error> {
        if !self.auto_eject_hosts {
            return Ok(());
        }
        let retry_timeout = self.server_retry_timeout;
        let server = &mut self.servers[idx as usize];
        if server.next_retry == 0 {
            return Ok(());
        }
        if server.is_ejected(now) || server.probe_outstanding() {
            metrics::NO_SERVER_ERRORS.increment();
            return Err(Error::NoServerAvailable);
        }
        // The retry deadline has passed; this request is the probe.
        server.begin_probe(now, retry_timeout);
        metrics::SERVER_PROBES.increment();
        debug!(pool = %self.name, server = %server.pname, "probing ejected server");
        Ok(())
    }

    /// A completed exchange on `server`. Returns the server back to
    /// live if it was ejected, scheduling the rebuild idempotently.
    pub fn server_ok(&mut self, server: u32) {
        if self.servers[server as usize].note_success() {
            metrics::SERVER_REVIVALS.increment();
            self.schedule_rebuild();
        }
    }

    /// Charge a failure to `server`. On ejection, closes all of its
    /// connections and returns them with the exchanges they carried.
    pub fn server_failed(
        &mut self,
        driver: &mut dyn Driver,
        server: u32,
        now: u64,
    ) -> Vec<ServerConnection> {
        let limit = self.server_failure_limit;
        let retry_timeout = self.server_retry_timeout;
        let auto_eject = self.auto_eject_hosts;
        let server = &mut self.servers[server as usize];

        if server.note_failure(now, limit, retry_timeout, auto_eject) {
            metrics::SERVER_EJECTIONS.increment();
            let closed = server.close_all(driver);
            self.schedule_rebuild();
            closed
        } else {
            Vec::new()
        }
    }

    /// Pick a connection to `server`, creating one lazily below the
    /// per-server cap.
    pub fn server_conn(
        &mut self,
        driver: &mut dyn Driver,
        server: u32,
    ) -> Result<(ConnId, bool), Error> {
        let cap = self.server_connections;
        self.servers[server as usize].conn_for_request(driver, cap)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Eagerly open one connection per server. Failures are logged and
    /// do not abort startup.
    pub fn preconnect_servers(&mut self, driver: &mut dyn Driver) -> Vec<(u32, ConnId)> {
        let mut opened = Vec::with_capacity(self.servers.len());
        for server in &mut self.servers {
            match server.open_conn(driver) {
                Ok(conn) => opened.push((server.idx, conn)),
                Err(e) => {
                    warn!(pool = %self.name, server = %server.pname, error = %e, "preconnect failed");
                }
            }
        }
        opened
    }

    /// Close every server connection, leaving the pool itself intact.
    /// Returns the closed connections with their unanswered exchanges.
    pub fn disconnect_servers(&mut self, driver: &mut dyn Driver) -> Vec<ServerConnection> {
        let mut closed = Vec::new();
        for server in &mut self.servers {
            closed.extend(server.close_all(driver));
        }
        closed
    }

    // ── Clients and listener ────────────────────────────────────────

    /// Admit a client connection. Refuses when the cap is reached.
    pub fn add_client(&mut self, conn: ConnId) -> bool {
        if self.client_connections != 0 && self.clients.len() as u32 >= self.client_connections {
            return false;
        }
        self.clients.push(conn);
        metrics::CLIENT_CONNECTIONS.increment();
        true
    }

    pub fn remove_client(&mut self, conn: ConnId) -> bool {
        match self.clients.iter().position(|&c| c == conn) {
            Some(at) => {
                self.clients.swap_remove(at);
                metrics::CLIENT_CONNECTIONS.decrement();
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.clients.iter().copied()
    }

    /// All client connections, removed; used at teardown.
    pub fn drain_clients(&mut self) -> Vec<ConnId> {
        metrics::CLIENT_CONNECTIONS.sub(self.clients.len() as i64);
        std::mem::take(&mut self.clients)
    }

    pub fn drained(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn listener(&self) -> Option<ConnId> {
        self.listener
    }

    pub fn set_listener(&mut self, conn: Option<ConnId>) {
        self.listener = conn;
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server_mut(&mut self, idx: u32) -> &mut Server {
        &mut self.servers[idx as usize]
    }

    pub fn nlive_server(&self) -> u32 {
        self.nlive_server
    }

    pub fn continuum(&self) -> &Continuum {
        &self.continuum
    }

    /// Per-request timeout in milliseconds.
    pub fn timeout(&self) -> u64 {
        self.timeout_ms
    }

    /// Connect-time commands forwarded to redis backends.
    pub fn preamble(&self) -> &[Bytes] {
        &self.preamble
    }
}

fn parse_listen(config: &PoolConfig) -> Result<SockInfo, Error> {
    let listen = config.listen.trim();
    if listen.starts_with('/') {
        return Ok(SockInfo::Unix {
            path: listen.into(),
            perm: config.perm,
        });
    }
    let (host, port) = listen.rsplit_once(':').ok_or_else(|| {
        Error::ConfigInvalid(format!(
            "pool {}: listen {listen:?} is not host:port or a unix path",
            config.name
        ))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        Error::ConfigInvalid(format!("pool {}: invalid listen port {port:?}", config.name))
    })?;
    let addr = (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::ResolveFailed(listen.to_owned()))?;
    Ok(SockInfo::Inet(addr))
}

fn build_preamble(config: &PoolConfig) -> Vec<Bytes> {
    let mut commands = Vec::new();
    if config.redis {
        if let Some(password) = &config.redis_auth {
            commands.push(resp_command(&[b"AUTH", password.as_bytes()]));
        }
        if let Some(db) = config.redis_db {
            commands.push(resp_command(&[b"SELECT", db.to_string().as_bytes()]));
        }
    }
    commands
}

fn resp_command(args: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf.freeze()
}
