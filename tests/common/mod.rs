//! Shared test harness: a recording driver and registry helpers.
#![allow(dead_code)]

use shardmux::{Config, ConnId, Driver, Pools, SockInfo};
use std::collections::HashMap;
use std::io;

/// An in-memory driver recording every requested socket operation.
#[derive(Default)]
pub struct FakeDriver {
    next: u64,
    pub listens: Vec<(ConnId, SockInfo)>,
    pub connects: Vec<(ConnId, SockInfo)>,
    pub sent: HashMap<ConnId, Vec<Vec<u8>>>,
    pub closed: Vec<ConnId>,
    /// When set, connect requests fail with ECONNREFUSED.
    pub refuse_connects: bool,
}

impl FakeDriver {
    pub fn sent_to(&self, conn: ConnId) -> Vec<Vec<u8>> {
        self.sent.get(&conn).cloned().unwrap_or_default()
    }

    /// Port of the backend a connection was opened to.
    pub fn port_of(&self, conn: ConnId) -> u16 {
        match self
            .connects
            .iter()
            .find(|(id, _)| *id == conn)
            .map(|(_, info)| info)
        {
            Some(SockInfo::Inet(addr)) => addr.port(),
            other => panic!("no inet connect recorded for {conn}: {other:?}"),
        }
    }

    pub fn is_closed(&self, conn: ConnId) -> bool {
        self.closed.contains(&conn)
    }
}

impl Driver for FakeDriver {
    fn listen(&mut self, info: &SockInfo, _backlog: u32) -> io::Result<ConnId> {
        self.next += 1;
        let id = ConnId(self.next);
        self.listens.push((id, info.clone()));
        Ok(id)
    }

    fn connect(&mut self, info: &SockInfo) -> io::Result<ConnId> {
        if self.refuse_connects {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        self.next += 1;
        let id = ConnId(self.next);
        self.connects.push((id, info.clone()));
        Ok(id)
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) -> io::Result<()> {
        self.sent.entry(conn).or_default().push(data.to_vec());
        Ok(())
    }

    fn close(&mut self, conn: ConnId) {
        self.closed.push(conn);
    }
}

/// Build and start a registry from a TOML string.
pub fn start_registry(toml: &str) -> (Pools, FakeDriver) {
    let config = Config::parse(toml).unwrap();
    let mut pools = Pools::from_config(&config).unwrap();
    let mut driver = FakeDriver::default();
    pools.start(&mut driver).unwrap();
    (pools, driver)
}

/// Hand a freshly accepted client to the named pool.
pub fn accept_client(
    pools: &mut Pools,
    driver: &mut FakeDriver,
    pool_name: &str,
    client: ConnId,
) -> ConnId {
    let listener = pools.get(pool_name).unwrap().listener().unwrap();
    pools.client_accepted(driver, listener, client).unwrap();
    client
}

/// Find a key the named pool routes to the wanted server slot.
pub fn key_for_server(pools: &mut Pools, pool_name: &str, server: u32) -> Vec<u8> {
    let pool = pools.get_mut(pool_name).unwrap();
    for i in 0..10_000u32 {
        let key = format!("probe-key-{i}").into_bytes();
        if pool.idx_for_key(&key).unwrap() == server {
            return key;
        }
    }
    panic!("no key found for server {server}");
}
