//! Ejection, retry probing, and failure accounting, driven through the
//! registry's event entry points with a recording driver.

mod common;

use common::{FakeDriver, accept_client, key_for_server, start_registry};
use shardmux::{ConnId, Error, FaultKind, Pools};

const SEC: u64 = 1_000_000;

fn eject_registry() -> (Pools, FakeDriver) {
    start_registry(
        r#"
        [[pools]]
        name = "alpha"
        listen = "127.0.0.1:22121"
        hash = "fnv1a_64"
        distribution = "ketama"
        auto_eject_hosts = true
        server_failure_limit = 2
        server_retry_timeout = 30000
        servers = [
            "10.0.0.1:11211:1 a",
            "10.0.0.2:11212:1 b",
            "10.0.0.3:11213:1 c",
        ]
        "#,
    )
}

#[test]
fn two_failures_eject_then_probe_then_revive() {
    let (mut pools, mut driver) = eject_registry();
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));

    let key = key_for_server(&mut pools, "alpha", 0);
    let target_port = 11211;

    // First failure: request forwarded, then the connection faults.
    let conn = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 1, SEC)
        .unwrap();
    assert_eq!(driver.port_of(conn), target_port);
    pools.conn_fault(&mut driver, conn, FaultKind::Transport, SEC);
    let failed = pools.take_failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].client, client);
    assert_eq!(failed[0].handle, 1);

    // Second failure ejects the server.
    let conn = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 2, 2 * SEC)
        .unwrap();
    pools.conn_fault(&mut driver, conn, FaultKind::Transport, 2 * SEC);
    assert_eq!(pools.take_failed().len(), 1);

    // The keyspace now routes around the dead server.
    let conn = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 3, 3 * SEC)
        .unwrap();
    assert_ne!(driver.port_of(conn), target_port);
    pools.server_response(conn, 3 * SEC).unwrap().unwrap();
    {
        let pool = pools.get_mut("alpha").unwrap();
        pool.update(3 * SEC);
        assert_eq!(pool.nlive_server(), 2);
    }

    // Before the retry deadline nothing reaches the dead server.
    let pool = pools.get_mut("alpha").unwrap();
    assert!(pool.continuum().points().iter().all(|p| p.server != 0));

    // At the deadline the server re-enters the distribution and the
    // first request through is the probe.
    let probe_at = 2 * SEC + 30 * SEC;
    let probe = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 4, probe_at)
        .unwrap();
    assert_eq!(driver.port_of(probe), target_port);

    // While the probe is outstanding the server admits nothing else.
    let refused = pools.dispatch(&mut driver, client, &key, b"get k\r\n", 5, probe_at);
    assert!(matches!(refused, Err(Error::NoServerAvailable)));

    // Probe succeeds: the server is fully revived.
    let done = pools.server_response(probe, probe_at + 1).unwrap().unwrap();
    assert_eq!(done.client, client);
    assert_eq!(done.handle, 4);
    let pool = pools.get_mut("alpha").unwrap();
    pool.update(probe_at + 2);
    assert_eq!(pool.nlive_server(), 3);
    assert_eq!(pool.server_mut(0).failure_count, 0);
    assert_eq!(pool.server_mut(0).next_retry, 0);
}

#[test]
fn failed_probe_rearms_linear_retry() {
    let (mut pools, mut driver) = eject_registry();
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));
    let key = key_for_server(&mut pools, "alpha", 1);

    for handle in 0..2 {
        let conn = pools
            .dispatch(&mut driver, client, &key, b"get k\r\n", handle, SEC)
            .unwrap();
        pools.conn_fault(&mut driver, conn, FaultKind::Transport, SEC);
    }
    pools.take_failed();

    // Probe at the first deadline fails; the next window opens one
    // retry-timeout later, not exponentially.
    let first_deadline = SEC + 30 * SEC;
    let probe = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 10, first_deadline)
        .unwrap();
    assert_eq!(driver.port_of(probe), 11212);
    pools.conn_fault(&mut driver, probe, FaultKind::Connect, first_deadline);
    pools.take_failed();

    // Mid-window the keyspace routes around the still-dead server.
    let mid_window = first_deadline + 15 * SEC;
    let detour = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 11, mid_window)
        .unwrap();
    assert_ne!(driver.port_of(detour), 11212);

    let second_deadline = first_deadline + 30 * SEC;
    let probe = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 12, second_deadline)
        .unwrap();
    assert_eq!(driver.port_of(probe), 11212);
}

#[test]
fn ejection_fails_other_in_flight_exchanges() {
    let (mut pools, mut driver) = start_registry(
        r#"
        [[pools]]
        name = "alpha"
        listen = "127.0.0.1:22121"
        auto_eject_hosts = true
        server_failure_limit = 1
        server_retry_timeout = 30000
        server_connections = 2
        servers = ["10.0.0.1:11211:1 a", "10.0.0.2:11212:1 b"]
        "#,
    );
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));
    let key = key_for_server(&mut pools, "alpha", 0);

    // Two exchanges on two connections to the same server.
    let first = pools
        .dispatch(&mut driver, client, &key, b"get a\r\n", 1, SEC)
        .unwrap();
    let second = pools
        .dispatch(&mut driver, client, &key, b"get b\r\n", 2, SEC)
        .unwrap();
    assert_ne!(first, second);

    // One fault ejects (limit 1); the sibling connection's exchange
    // fails with it.
    pools.conn_fault(&mut driver, first, FaultKind::Transport, SEC);
    let failed = pools.take_failed();
    let mut handles: Vec<u64> = failed.iter().map(|c| c.handle).collect();
    handles.sort_unstable();
    assert_eq!(handles, vec![1, 2]);
    assert!(driver.is_closed(second));
}

#[test]
fn timeout_closes_connection_and_charges_failure() {
    let (mut pools, mut driver) = eject_registry();
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));
    let key = key_for_server(&mut pools, "alpha", 2);

    let conn = pools
        .dispatch(&mut driver, client, &key, b"get k\r\n", 1, SEC)
        .unwrap();
    pools.conn_timeout(&mut driver, conn, 2 * SEC);

    assert!(driver.is_closed(conn));
    let failed = pools.take_failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].handle, 1);
    assert_eq!(
        pools.get_mut("alpha").unwrap().server_mut(2).failure_count,
        1
    );
}

#[test]
fn connect_refusal_counts_toward_ejection() {
    let (mut pools, mut driver) = start_registry(
        r#"
        [[pools]]
        name = "alpha"
        listen = "127.0.0.1:22121"
        auto_eject_hosts = true
        server_failure_limit = 1
        server_retry_timeout = 30000
        servers = ["10.0.0.1:11211:1 a", "10.0.0.2:11212:1 b"]
        "#,
    );
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));
    let key = key_for_server(&mut pools, "alpha", 0);

    driver.refuse_connects = true;
    let err = pools.dispatch(&mut driver, client, &key, b"get k\r\n", 1, SEC);
    assert!(matches!(err, Err(Error::ConnectFailed)));

    // Limit 1: the refused connect ejected the server.
    let pool = pools.get_mut("alpha").unwrap();
    pool.update(SEC + 1);
    assert_eq!(pool.nlive_server(), 1);
}

#[test]
fn all_servers_ejected_means_no_server_available() {
    let (mut pools, mut driver) = start_registry(
        r#"
        [[pools]]
        name = "alpha"
        listen = "127.0.0.1:22121"
        auto_eject_hosts = true
        server_failure_limit = 1
        server_retry_timeout = 30000
        servers = ["10.0.0.1:11211:1 a"]
        "#,
    );
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));

    let conn = pools
        .dispatch(&mut driver, client, b"k", b"get k\r\n", 1, SEC)
        .unwrap();
    pools.conn_fault(&mut driver, conn, FaultKind::Transport, SEC);
    pools.take_failed();

    let err = pools.dispatch(&mut driver, client, b"k", b"get k\r\n", 2, 2 * SEC);
    assert!(matches!(err, Err(Error::NoServerAvailable)));
}

#[test]
fn redis_preamble_precedes_first_request() {
    let (mut pools, mut driver) = start_registry(
        r#"
        [[pools]]
        name = "alpha"
        listen = "127.0.0.1:22121"
        redis = true
        redis_auth = "hunter2"
        redis_db = 2
        servers = ["10.0.0.1:6379:1 a"]
        "#,
    );
    let client = accept_client(&mut pools, &mut driver, "alpha", ConnId(9001));

    let conn = pools
        .dispatch(&mut driver, client, b"k", b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", 1, SEC)
        .unwrap();
    pools.server_connected(&mut driver, conn, SEC);

    let sent = driver.sent_to(conn);
    assert_eq!(sent.len(), 3);
    assert!(sent[0].starts_with(b"*2\r\n$4\r\nAUTH\r\n"));
    assert!(sent[1].starts_with(b"*2\r\n$6\r\nSELECT\r\n"));
    assert!(sent[2].starts_with(b"*2\r\n$3\r\nGET\r\n"));

    // Preamble replies are swallowed; the client reply comes third.
    assert!(pools.server_response(conn, SEC).unwrap().is_none());
    assert!(pools.server_response(conn, SEC).unwrap().is_none());
    let done = pools.server_response(conn, SEC).unwrap().unwrap();
    assert_eq!(done.client, client);
    assert_eq!(done.handle, 1);
}
