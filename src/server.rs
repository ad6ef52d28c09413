//! Backend servers and their connection fanout.

use crate::config::ServerConfig;
use crate::driver::{ConnId, Driver, SockInfo};
use crate::error::Error;
use std::collections::VecDeque;
use std::net::ToSocketAddrs;
use tracing::debug;

/// State of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect in progress.
    Connecting,
    /// Connected, ready for requests.
    Active,
}

/// An in-flight exchange awaiting its response.
///
/// Responses on a connection arrive in FIFO order, so the front entry
/// always matches the next response. `client` is `None` for internal
/// exchanges (the redis connect preamble) whose replies are swallowed.
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    pub client: Option<ConnId>,
    pub handle: u64,
}

/// One multiplexed connection to a backend server.
#[derive(Debug)]
pub struct ServerConnection {
    pub id: ConnId,
    pub state: ConnState,
    pub in_flight: VecDeque<InFlight>,
}

impl ServerConnection {
    fn new(id: ConnId) -> Self {
        Self {
            id,
            state: ConnState::Connecting,
            in_flight: VecDeque::new(),
        }
    }
}

/// One backend endpoint with health state and connection fanout.
#[derive(Debug)]
pub struct Server {
    /// Stable index within the owning pool.
    pub idx: u32,
    /// Display name, `host:port:weight`.
    pub pname: String,
    /// Identity used for continuum point derivation.
    pub name: String,
    pub info: SockInfo,
    pub weight: u32,

    conns: Vec<ServerConnection>,
    rr_cursor: usize,

    /// Consecutive failures since the last completed exchange.
    pub failure_count: u32,
    /// Absolute µs deadline for the next retry; 0 while live.
    pub next_retry: u64,
    /// A probe was dispatched and has not yet resolved.
    probing: bool,
}

impl Server {
    pub fn new(idx: u32, config: &ServerConfig) -> Result<Self, Error> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::ResolveFailed(format!("{}:{}", config.host, config.port)))?;

        Ok(Server {
            idx,
            pname: config.pname(),
            name: config.identity(),
            info: SockInfo::Inet(addr),
            weight: config.weight,
            conns: Vec::new(),
            rr_cursor: 0,
            failure_count: 0,
            next_retry: 0,
            probing: false,
        })
    }

    /// A server is live while not ejected, or once its retry deadline
    /// has passed.
    pub fn is_live(&self, now: u64) -> bool {
        self.next_retry == 0 || now >= self.next_retry
    }

    /// Ejected and still inside the retry window.
    pub fn is_ejected(&self, now: u64) -> bool {
        self.next_retry != 0 && now < self.next_retry
    }

    /// In the retry window with a probe not yet resolved.
    pub fn needs_probe(&self, now: u64) -> bool {
        self.next_retry != 0 && now >= self.next_retry && !self.probing
    }

    pub fn probe_outstanding(&self) -> bool {
        self.probing
    }

    /// Arm the single-flight probe. Re-arms the retry deadline so a
    /// lost probe answer degenerates to the linear retry schedule.
    pub fn begin_probe(&mut self, now: u64, retry_timeout: u64) {
        self.probing = true;
        self.next_retry = now + retry_timeout;
    }

    /// A request exchange completed without error. Returns true when
    /// this transitions the server back to live.
    pub fn note_success(&mut self) -> bool {
        self.failure_count = 0;
        let revived = self.next_retry != 0;
        self.next_retry = 0;
        self.probing = false;
        revived
    }

    /// A transport error or timeout was charged to this server.
    /// Returns true when the server is ejected (or stays ejected after
    /// a failed probe) and the distribution must be rebuilt.
    pub fn note_failure(
        &mut self,
        now: u64,
        failure_limit: u32,
        retry_timeout: u64,
        auto_eject: bool,
    ) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);

        if self.probing {
            // The probe failed; the deadline set at dispatch stands.
            self.probing = false;
            return true;
        }
        if auto_eject && self.failure_count >= failure_limit {
            self.next_retry = now + retry_timeout;
            debug!(
                server = %self.pname,
                failures = self.failure_count,
                "server ejected"
            );
            return true;
        }
        false
    }

    /// Pick a connection for a request: create lazily while below the
    /// cap and nothing is idle, otherwise round-robin over active
    /// connections. Returns the connection and whether it was created.
    pub fn conn_for_request(
        &mut self,
        driver: &mut dyn Driver,
        cap: u32,
    ) -> Result<(ConnId, bool), Error> {
        let has_idle = self
            .conns
            .iter()
            .any(|c| c.state == ConnState::Active && c.in_flight.is_empty());

        if (self.conns.len() as u32) < cap && !has_idle {
            return self.open_conn(driver).map(|id| (id, true));
        }

        // Failed connections are removed at fault time, so everything
        // still queued is usable.
        if self.conns.is_empty() {
            return self.open_conn(driver).map(|id| (id, true));
        }
        let at = self.rr_cursor % self.conns.len();
        self.rr_cursor = at + 1;
        Ok((self.conns[at].id, false))
    }

    /// Open one connection unconditionally (preconnect path).
    pub fn open_conn(&mut self, driver: &mut dyn Driver) -> Result<ConnId, Error> {
        let id = driver.connect(&self.info).map_err(|e| {
            debug!(server = %self.pname, error = %e, "connect failed");
            Error::ConnectFailed
        })?;
        self.conns.push(ServerConnection::new(id));
        Ok(id)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn conn_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.conns.iter().map(|c| c.id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut ServerConnection> {
        self.conns.iter_mut().find(|c| c.id == id)
    }

    /// Record an exchange enqueued on `conn`.
    pub fn push_in_flight(&mut self, conn: ConnId, entry: InFlight) {
        if let Some(conn) = self.conn_mut(conn) {
            conn.in_flight.push_back(entry);
        }
    }

    /// Complete the oldest exchange on `conn`.
    pub fn pop_response(&mut self, conn: ConnId) -> Option<InFlight> {
        self.conn_mut(conn).and_then(|c| c.in_flight.pop_front())
    }

    /// Drop one connection, returning its unanswered exchanges.
    pub fn take_conn(&mut self, id: ConnId) -> Vec<InFlight> {
        match self.conns.iter().position(|c| c.id == id) {
            Some(at) => {
                let conn = self.conns.remove(at);
                if at < self.rr_cursor {
                    self.rr_cursor -= 1;
                }
                conn.in_flight.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close every connection, returning them with their unanswered
    /// exchanges so the owner can unmap ids and fail the exchanges.
    pub fn close_all(&mut self, driver: &mut dyn Driver) -> Vec<ServerConnection> {
        let conns: Vec<ServerConnection> = self.conns.drain(..).collect();
        for conn in &conns {
            driver.close(conn.id);
        }
        self.rr_cursor = 0;
        conns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::io;

    struct CountingDriver {
        next: u64,
        connects: usize,
    }

    impl Driver for CountingDriver {
        fn listen(&mut self, _info: &SockInfo, _backlog: u32) -> io::Result<ConnId> {
            unreachable!("servers do not listen")
        }
        fn connect(&mut self, _info: &SockInfo) -> io::Result<ConnId> {
            self.connects += 1;
            self.next += 1;
            Ok(ConnId(self.next))
        }
        fn send(&mut self, _conn: ConnId, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self, _conn: ConnId) {}
    }

    fn server() -> Server {
        Server::new(0, &ServerConfig::parse("127.0.0.1:11211:1").unwrap()).unwrap()
    }

    #[test]
    fn lazy_create_up_to_cap_then_round_robin() {
        let mut driver = CountingDriver { next: 0, connects: 0 };
        let mut server = server();

        let (first, created) = server.conn_for_request(&mut driver, 2).unwrap();
        assert!(created);
        server.conn_mut(first).unwrap().state = ConnState::Active;
        server.push_in_flight(first, InFlight { client: None, handle: 1 });

        // First conn busy, below cap: a second is created.
        let (second, created) = server.conn_for_request(&mut driver, 2).unwrap();
        assert!(created);
        assert_ne!(first, second);
        server.conn_mut(second).unwrap().state = ConnState::Active;
        server.push_in_flight(second, InFlight { client: None, handle: 2 });

        // At cap: alternating picks over the two connections.
        let (a, created) = server.conn_for_request(&mut driver, 2).unwrap();
        assert!(!created);
        let (b, _) = server.conn_for_request(&mut driver, 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(driver.connects, 2);
    }

    #[test]
    fn idle_connection_reused_before_creating() {
        let mut driver = CountingDriver { next: 0, connects: 0 };
        let mut server = server();

        let (first, _) = server.conn_for_request(&mut driver, 4).unwrap();
        server.conn_mut(first).unwrap().state = ConnState::Active;

        let (again, created) = server.conn_for_request(&mut driver, 4).unwrap();
        assert_eq!(first, again);
        assert!(!created);
        assert_eq!(driver.connects, 1);
    }

    #[test]
    fn failure_accounting_ejects_at_limit() {
        let mut server = server();
        assert!(!server.note_failure(1_000, 2, 500, true));
        assert!(server.is_live(1_000));
        assert!(server.note_failure(1_000, 2, 500, true));
        assert_eq!(server.next_retry, 1_500);
        assert!(server.is_ejected(1_200));
        assert!(!server.is_live(1_200));
        assert!(server.is_live(1_500));
        assert!(server.needs_probe(1_500));
    }

    #[test]
    fn no_ejection_without_auto_eject() {
        let mut server = server();
        for _ in 0..10 {
            assert!(!server.note_failure(1_000, 2, 500, false));
        }
        assert_eq!(server.next_retry, 0);
        assert!(server.is_live(1_000));
    }

    #[test]
    fn probe_single_flight_and_linear_retry() {
        let mut server = server();
        server.note_failure(1_000, 1, 500, true);
        assert!(server.needs_probe(1_500));

        server.begin_probe(1_500, 500);
        assert!(server.probe_outstanding());
        assert!(!server.needs_probe(1_500));
        // Probe failure leaves the re-armed deadline in place.
        server.note_failure(1_600, 1, 500, true);
        assert!(!server.probe_outstanding());
        assert_eq!(server.next_retry, 2_000);
        // Success clears everything.
        server.begin_probe(2_000, 500);
        assert!(server.note_success());
        assert_eq!(server.next_retry, 0);
        assert_eq!(server.failure_count, 0);
    }

    #[test]
    fn close_all_returns_orphans() {
        let mut driver = CountingDriver { next: 0, connects: 0 };
        let mut server = server();
        let (conn, _) = server.conn_for_request(&mut driver, 1).unwrap();
        server.push_in_flight(conn, InFlight { client: Some(ConnId(99)), handle: 7 });

        let closed = server.close_all(&mut driver);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, conn);
        assert_eq!(closed[0].in_flight.len(), 1);
        assert_eq!(closed[0].in_flight[0].client, Some(ConnId(99)));
        assert_eq!(closed[0].in_flight[0].handle, 7);
        assert_eq!(server.conn_count(), 0);
    }
}
