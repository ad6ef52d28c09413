//! The pools registry: event entry points, hot reload, traversal.
//!
//! One registry is owned by one worker; every method runs on that
//! worker, so the registry holds no locks. Time enters as an absolute
//! microsecond clock supplied by the event loop.

use crate::config::Config;
use crate::driver::{ConnId, Driver};
use crate::error::{Error, FaultKind};
use crate::metrics;
use crate::pool::{PoolId, ReloadState, ServerPool};
use crate::server::{ConnState, InFlight, Server, ServerConnection};
use ahash::AHashMap;
use tracing::{debug, error, info, warn};

/// Tagged non-owning back-reference from a connection to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnOwner {
    Listener { pool: PoolId },
    Client { pool: PoolId },
    Backend { pool: PoolId, server: u32 },
}

/// A finished exchange handed back to the connection layer: the client
/// the response (or error) belongs to, and the caller's opaque handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub client: ConnId,
    pub handle: u64,
}

/// One visit of the registry traversal.
pub enum Element<'a> {
    Pool(&'a ServerPool),
    Server(&'a Server),
    Connection(ConnId),
}

/// The ordered collection of active pools.
///
/// During a reload window the registry holds the old pools followed by
/// the staged new ones; [`Pools::finish_replacement`] retires drained
/// old pools until only the new set remains.
pub struct Pools {
    pools: Vec<ServerPool>,
    conns: AHashMap<ConnId, ConnOwner>,
    /// Exchanges failed by faults, ejections, or teardown, awaiting
    /// error delivery by the connection layer.
    failed: Vec<Completion>,
    next_pool_id: u32,
}

fn pool_by_id(pools: &[ServerPool], id: PoolId) -> Option<&ServerPool> {
    pools.iter().find(|p| p.id == id)
}

fn pool_by_id_mut(pools: &mut [ServerPool], id: PoolId) -> Option<&mut ServerPool> {
    pools.iter_mut().find(|p| p.id == id)
}

impl Pools {
    /// Build the registry from validated configuration. Nothing is
    /// bound or connected until [`Pools::start`].
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let mut pools = Pools {
            pools: Vec::new(),
            conns: AHashMap::new(),
            failed: Vec::new(),
            next_pool_id: 0,
        };
        pools.pools = pools.build_pools(config)?;
        Ok(pools)
    }

    fn build_pools(&mut self, config: &Config) -> Result<Vec<ServerPool>, Error> {
        let mut built = Vec::with_capacity(config.pools.len());
        for (idx, record) in config.pools.iter().enumerate() {
            let id = PoolId(self.next_pool_id);
            self.next_pool_id += 1;
            built.push(ServerPool::new(id, idx as u32, record)?);
        }
        Ok(built)
    }

    /// Bind every pool's listener and run preconnect where configured.
    pub fn start(&mut self, driver: &mut dyn Driver) -> Result<(), Error> {
        for pool in &mut self.pools {
            let listener = driver.listen(&pool.listen, pool.backlog)?;
            pool.set_listener(Some(listener));
            self.conns.insert(listener, ConnOwner::Listener { pool: pool.id });
            info!(pool = %pool.name, listen = %pool.listen, "pool listening");

            if pool.preconnect {
                for (server, conn) in pool.preconnect_servers(driver) {
                    self.conns
                        .insert(conn, ConnOwner::Backend { pool: pool.id, server });
                    metrics::SERVER_CONNECTIONS.increment();
                    if let Err(e) = send_preamble(driver, pool, server, conn) {
                        warn!(pool = %pool.name, error = %e, "preconnect preamble failed");
                    }
                }
            }
        }
        Ok(())
    }

    // ── Event entry points ──────────────────────────────────────────

    /// A client finished the TCP handshake on `listener`.
    pub fn client_accepted(
        &mut self,
        driver: &mut dyn Driver,
        listener: ConnId,
        client: ConnId,
    ) -> Result<(), Error> {
        let Some(ConnOwner::Listener { pool: pool_id }) = self.conns.get(&listener).copied()
        else {
            driver.close(client);
            return Err(Error::PoolUnavailable);
        };
        let Some(pool) = pool_by_id_mut(&mut self.pools, pool_id) else {
            driver.close(client);
            return Err(Error::PoolUnavailable);
        };

        match pool.reload_state {
            ReloadState::OldDraining | ReloadState::NewWaitForOld => {
                driver.close(client);
                return Err(Error::PoolUnavailable);
            }
            _ => {}
        }
        if !pool.add_client(client) {
            warn!(pool = %pool.name, "client connection limit reached");
            driver.close(client);
            return Ok(());
        }
        self.conns.insert(client, ConnOwner::Client { pool: pool_id });
        debug!(pool = pool_id.0, %client, "client accepted");
        Ok(())
    }

    /// Route one client request: hash the key, pick the server, pick a
    /// connection, enqueue the payload. Returns the server connection
    /// the exchange rides on, so the caller can arm its timeout.
    pub fn dispatch(
        &mut self,
        driver: &mut dyn Driver,
        client: ConnId,
        key: &[u8],
        payload: &[u8],
        handle: u64,
        now: u64,
    ) -> Result<ConnId, Error> {
        let Some(ConnOwner::Client { pool: pool_id }) = self.conns.get(&client).copied() else {
            return Err(Error::PoolUnavailable);
        };
        let pool = pool_by_id_mut(&mut self.pools, pool_id).ok_or(Error::PoolUnavailable)?;
        if pool.reload_state == ReloadState::NewWaitForOld {
            return Err(Error::PoolUnavailable);
        }

        pool.update(now);
        let server = pool.idx_for_key(key)?;
        pool.admit_server(server, now)?;

        let conn = match pool.server_conn(driver, server) {
            Ok((conn, created)) => {
                if created {
                    self.conns
                        .insert(conn, ConnOwner::Backend { pool: pool_id, server });
                    metrics::SERVER_CONNECTIONS.increment();
                    // The connect preamble rides ahead of the first
                    // request on the connection's outbound queue.
                    if send_preamble(driver, pool, server, conn).is_err() {
                        self.backend_fault(driver, conn, FaultKind::Transport, now);
                        return Err(Error::TransportError);
                    }
                }
                conn
            }
            Err(e) => {
                // The connect never started; charge the failure now.
                let closed = pool.server_failed(driver, server, now);
                self.unmap_closed(closed);
                return Err(e);
            }
        };

        if let Err(e) = driver.send(conn, payload) {
            warn!(%conn, error = %e, "enqueue failed");
            self.backend_fault(driver, conn, FaultKind::Transport, now);
            return Err(Error::TransportError);
        }

        pool.server_mut(server)
            .push_in_flight(conn, InFlight { client: Some(client), handle });
        metrics::REQUESTS_FORWARDED.increment();
        Ok(conn)
    }

    /// A non-blocking connect to a backend completed successfully.
    pub fn server_connected(&mut self, _driver: &mut dyn Driver, conn: ConnId, _now: u64) {
        let Some(ConnOwner::Backend { pool: pool_id, server }) = self.conns.get(&conn).copied()
        else {
            return;
        };
        let Some(pool) = pool_by_id_mut(&mut self.pools, pool_id) else {
            return;
        };
        if let Some(connection) = pool.server_mut(server).conn_mut(conn) {
            connection.state = ConnState::Active;
            debug!(pool = %pool.name, %conn, "server connected");
        }
    }

    /// The oldest exchange on `conn` has its response. Returns the
    /// completion to relay, or `None` when the reply was internal
    /// (connect preamble) or the connection is already gone.
    pub fn server_response(
        &mut self,
        conn: ConnId,
        _now: u64,
    ) -> Result<Option<Completion>, Error> {
        let Some(ConnOwner::Backend { pool: pool_id, server }) = self.conns.get(&conn).copied()
        else {
            debug!(%conn, "response on unknown connection");
            return Ok(None);
        };
        let pool = pool_by_id_mut(&mut self.pools, pool_id).ok_or(Error::PoolUnavailable)?;

        let Some(entry) = pool.server_mut(server).pop_response(conn) else {
            error!(%conn, "response with nothing in flight");
            return Err(Error::TransportError);
        };
        pool.server_ok(server);
        metrics::RESPONSES_RECEIVED.increment();

        Ok(entry.client.map(|client| Completion { client, handle: entry.handle }))
    }

    /// A connection-level fault reported by the connection layer.
    /// Failed exchanges are queued for [`Pools::take_failed`].
    pub fn conn_fault(&mut self, driver: &mut dyn Driver, conn: ConnId, kind: FaultKind, now: u64) {
        match self.conns.get(&conn).copied() {
            Some(ConnOwner::Client { pool: pool_id }) => {
                self.conns.remove(&conn);
                driver.close(conn);
                if let Some(pool) = pool_by_id_mut(&mut self.pools, pool_id) {
                    pool.remove_client(conn);
                }
            }
            Some(ConnOwner::Backend { .. }) => {
                metrics::SERVER_FAULTS.increment();
                self.backend_fault(driver, conn, kind, now);
            }
            Some(ConnOwner::Listener { pool: pool_id }) => {
                error!(%conn, pool = pool_id.0, ?kind, "listener fault");
            }
            None => {}
        }
    }

    /// A request exceeded its pool timeout. The carrying connection is
    /// closed, its exchanges failed, and the failure charged.
    pub fn conn_timeout(&mut self, driver: &mut dyn Driver, conn: ConnId, now: u64) {
        if matches!(self.conns.get(&conn), Some(ConnOwner::Backend { .. })) {
            metrics::REQUEST_TIMEOUTS.increment();
            self.backend_fault(driver, conn, FaultKind::Transport, now);
        }
    }

    fn backend_fault(&mut self, driver: &mut dyn Driver, conn: ConnId, kind: FaultKind, now: u64) {
        let Some(ConnOwner::Backend { pool: pool_id, server }) = self.conns.remove(&conn) else {
            return;
        };
        driver.close(conn);
        metrics::SERVER_CONNECTIONS.decrement();

        let Some(pool) = pool_by_id_mut(&mut self.pools, pool_id) else {
            return;
        };
        warn!(
            pool = %pool.name,
            server = %pool.servers()[server as usize].pname,
            ?kind,
            "backend connection failed"
        );

        let orphaned = pool.server_mut(server).take_conn(conn);
        fail_exchanges(&mut self.failed, orphaned);

        let closed = pool.server_failed(driver, server, now);
        self.unmap_closed(closed);
    }

    /// A client connection closed; drain bookkeeping.
    pub fn client_closed(&mut self, conn: ConnId) {
        if let Some(ConnOwner::Client { pool: pool_id }) = self.conns.remove(&conn) {
            if let Some(pool) = pool_by_id_mut(&mut self.pools, pool_id) {
                pool.remove_client(conn);
            }
        }
    }

    /// Exchanges failed since the last call, for error delivery.
    pub fn take_failed(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.failed)
    }

    fn unmap_closed(&mut self, closed: Vec<ServerConnection>) {
        for connection in closed {
            self.conns.remove(&connection.id);
            metrics::SERVER_CONNECTIONS.decrement();
            fail_exchanges(&mut self.failed, connection.in_flight);
        }
    }

    // ── Hot reload ──────────────────────────────────────────────────

    /// Stage a replacement pool set and start the cutover.
    ///
    /// Pools are paired with their counterpart by name. Paired old
    /// pools advance to [`ReloadState::OldToShutdown`]; staged pools
    /// wait in [`ReloadState::NewWaitForOld`]. A staged pool whose
    /// endpoint is free binds its listener immediately. Any error
    /// building the staged pools aborts the reload and leaves the
    /// running registry untouched.
    pub fn kick_replacement(
        &mut self,
        driver: &mut dyn Driver,
        config: &Config,
    ) -> Result<(), Error> {
        if self.pools.iter().any(|p| p.reload_state.pending()) {
            warn!("replacement refused: a reload is still in progress");
            return Err(Error::PoolUnavailable);
        }
        let mut staged = self.build_pools(config)?;

        for pool in &mut staged {
            pool.reload_state = ReloadState::NewWaitForOld;
            if let Some(old) = self
                .pools
                .iter_mut()
                .find(|p| p.name == pool.name && is_steady(p.reload_state))
            {
                old.reload_state = ReloadState::OldToShutdown;
                old.counterpart = Some(pool.id);
                pool.counterpart = Some(old.id);
                info!(pool = %pool.name, "pool paired for replacement");
            }
        }
        // Old pools with no replacement drain away entirely.
        for old in &mut self.pools {
            if is_steady(old.reload_state) {
                old.reload_state = ReloadState::OldToShutdown;
                old.counterpart = None;
                info!(pool = %old.name, "pool retiring without replacement");
            }
        }

        // Staged pools whose endpoint is not held by their counterpart
        // can safely listen right away.
        for pool in &mut staged {
            let endpoint_held = pool
                .counterpart
                .and_then(|id| pool_by_id(&self.pools, id))
                .is_some_and(|old| old.listen == pool.listen);
            if !endpoint_held {
                match driver.listen(&pool.listen, pool.backlog) {
                    Ok(listener) => {
                        pool.set_listener(Some(listener));
                        self.conns
                            .insert(listener, ConnOwner::Listener { pool: pool.id });
                    }
                    Err(e) => {
                        // Retried when the pool is promoted.
                        warn!(pool = %pool.name, error = %e, "staged listener bind failed");
                    }
                }
            }
        }

        metrics::POOL_RELOADS.increment();
        self.pools.append(&mut staged);
        Ok(())
    }

    /// Advance the replacement state machine. Returns true exactly
    /// when no pool is left in a reload-pending state.
    pub fn finish_replacement(&mut self, driver: &mut dyn Driver, now: u64) -> bool {
        // Stop accepting on retiring pools.
        for at in 0..self.pools.len() {
            if self.pools[at].reload_state != ReloadState::OldToShutdown {
                continue;
            }
            if let Some(listener) = self.pools[at].listener() {
                driver.close(listener);
                self.conns.remove(&listener);
                self.pools[at].set_listener(None);
            }
            self.pools[at].reload_state = ReloadState::OldDraining;
            info!(pool = %self.pools[at].name, "listener closed, draining clients");
        }

        // Retire drained pools.
        let drained: Vec<PoolId> = self
            .pools
            .iter()
            .filter(|p| p.reload_state == ReloadState::OldDraining && p.drained())
            .map(|p| p.id)
            .collect();
        for id in drained {
            self.retire(driver, id);
        }

        // Promote staged pools whose counterpart is gone (or never was).
        for at in 0..self.pools.len() {
            if self.pools[at].reload_state != ReloadState::NewWaitForOld {
                continue;
            }
            let counterpart_alive = self.pools[at]
                .counterpart
                .is_some_and(|id| pool_by_id(&self.pools, id).is_some());
            if !counterpart_alive {
                self.promote(driver, at);
            }
        }

        self.pools.iter().all(|p| !p.reload_state.pending())
    }

    /// Free a drained old pool and clear its cross-links.
    fn retire(&mut self, driver: &mut dyn Driver, id: PoolId) {
        let Some(at) = self.pools.iter().position(|p| p.id == id) else {
            return;
        };
        let mut pool = self.pools.remove(at);

        if let Some(listener) = pool.listener() {
            driver.close(listener);
            self.conns.remove(&listener);
        }
        for client in pool.drain_clients() {
            self.conns.remove(&client);
            driver.close(client);
        }
        let closed = pool.disconnect_servers(driver);
        self.unmap_closed(closed);

        if let Some(counterpart) = pool.counterpart
            && let Some(staged) = pool_by_id_mut(&mut self.pools, counterpart)
        {
            staged.counterpart = None;
        }
        info!(pool = %pool.name, "old pool retired");
    }

    /// Activate a staged pool: take over the endpoint and go live.
    fn promote(&mut self, driver: &mut dyn Driver, at: usize) {
        let pool = &mut self.pools[at];
        if pool.listener().is_none() {
            match driver.listen(&pool.listen, pool.backlog) {
                Ok(listener) => {
                    pool.set_listener(Some(listener));
                    self.conns
                        .insert(listener, ConnOwner::Listener { pool: pool.id });
                }
                Err(e) => {
                    // Stay pending; the next poll retries the bind.
                    warn!(pool = %pool.name, error = %e, "listener takeover failed");
                    return;
                }
            }
        }
        pool.reload_state = ReloadState::New;
        pool.counterpart = None;
        metrics::POOL_PROMOTIONS.increment();
        info!(pool = %pool.name, listen = %pool.listen, "new pool active");

        if pool.preconnect {
            let pool_id = pool.id;
            for (server, conn) in pool.preconnect_servers(driver) {
                self.conns
                    .insert(conn, ConnOwner::Backend { pool: pool_id, server });
                metrics::SERVER_CONNECTIONS.increment();
                if let Err(e) = send_preamble(driver, pool, server, conn) {
                    warn!(pool = %pool.name, error = %e, "preconnect preamble failed");
                }
            }
        }
    }

    /// Tear down every pool, cancelling all pending exchanges.
    pub fn deinit(&mut self, driver: &mut dyn Driver) {
        for mut pool in std::mem::take(&mut self.pools) {
            if let Some(listener) = pool.listener() {
                driver.close(listener);
                self.conns.remove(&listener);
            }
            for client in pool.drain_clients() {
                self.conns.remove(&client);
                driver.close(client);
            }
            let closed = pool.disconnect_servers(driver);
            self.unmap_closed(closed);
            info!(pool = %pool.name, "pool deinitialized");
        }
        self.conns.clear();
    }

    // ── Traversal and inspection ────────────────────────────────────

    /// Fold a visitor over every pool, server, and connection.
    ///
    /// Visit order is deterministic: pools in registry order; within a
    /// pool, each server followed by its connections, then the pool's
    /// own connections (listener before clients).
    pub fn fold<A>(&self, acc: A, mut visit: impl FnMut(A, Element<'_>) -> A) -> A {
        let mut acc = acc;
        for pool in &self.pools {
            acc = visit(acc, Element::Pool(pool));
            for server in pool.servers() {
                acc = visit(acc, Element::Server(server));
                for conn in server.conn_ids() {
                    acc = visit(acc, Element::Connection(conn));
                }
            }
            if let Some(listener) = pool.listener() {
                acc = visit(acc, Element::Connection(listener));
            }
            for client in pool.client_ids() {
                acc = visit(acc, Element::Connection(client));
            }
        }
        acc
    }

    /// Log a one-line status per pool plus registry totals.
    pub fn log_summary(&self) {
        let (npools, nservers, nconns) = self.fold((0u32, 0u32, 0u32), |acc, elem| match elem {
            Element::Pool(_) => (acc.0 + 1, acc.1, acc.2),
            Element::Server(_) => (acc.0, acc.1 + 1, acc.2),
            Element::Connection(_) => (acc.0, acc.1, acc.2 + 1),
        });
        info!(pools = npools, servers = nservers, connections = nconns, "registry status");
        for pool in &self.pools {
            info!(
                pool = %pool.name,
                state = ?pool.reload_state,
                live = pool.nlive_server(),
                servers = pool.servers().len(),
                clients = pool.client_count(),
                "pool status"
            );
        }
    }

    /// Per-request timeout (ms) for the pool owning `conn`.
    pub fn timeout_for(&self, conn: ConnId) -> Option<u64> {
        let pool_id = match self.conns.get(&conn)? {
            ConnOwner::Client { pool }
            | ConnOwner::Backend { pool, .. }
            | ConnOwner::Listener { pool } => *pool,
        };
        pool_by_id(&self.pools, pool_id).map(|p| p.timeout())
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerPool> {
        self.pools.iter()
    }

    /// Look a pool up by name.
    pub fn get(&self, name: &str) -> Option<&ServerPool> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServerPool> {
        self.pools.iter_mut().find(|p| p.name == name)
    }
}

fn is_steady(state: ReloadState) -> bool {
    matches!(state, ReloadState::OldAndActive | ReloadState::New)
}

/// Enqueue a pool's connect-time commands (redis AUTH/SELECT) on a
/// fresh backend connection. Their replies are swallowed internally.
fn send_preamble(
    driver: &mut dyn Driver,
    pool: &mut ServerPool,
    server: u32,
    conn: ConnId,
) -> std::io::Result<()> {
    for command in pool.preamble().to_vec() {
        driver.send(conn, &command)?;
        pool.server_mut(server)
            .push_in_flight(conn, InFlight { client: None, handle: 0 });
    }
    Ok(())
}

fn fail_exchanges(failed: &mut Vec<Completion>, exchanges: impl IntoIterator<Item = InFlight>) {
    for exchange in exchanges {
        if let Some(client) = exchange.client {
            metrics::REQUESTS_FAILED.increment();
            failed.push(Completion { client, handle: exchange.handle });
        }
    }
}
