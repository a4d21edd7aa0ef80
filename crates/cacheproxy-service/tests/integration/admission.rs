use std::io::Read;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use cacheproxy_service::cache::EntryState;
use cacheproxy_service::config::Config;
use cacheproxy_test::Origin;

use crate::TestProxy;

#[test]
fn test_connections_beyond_capacity_wait() {
    crate::setup();

    let delay = Duration::from_millis(300);
    let origin = Origin::builder().body("HELLO").delay(delay).start();
    let proxy = TestProxy::with_config(Config {
        max_connections: 1,
        ..crate::config(&origin)
    });

    let start = Instant::now();
    let clients: Vec<_> = (0..2)
        .map(|i| {
            let addr = proxy.addr();
            thread::spawn(move || cacheproxy_test::get(addr, &format!("http://example.com/{i}")))
        })
        .collect();
    for client in clients {
        assert_eq!(client.join().unwrap(), b"HELLO");
    }

    // With a single slot, the second client is only served once the first one is done.
    assert!(start.elapsed() >= delay * 2);
    assert_eq!(origin.connections(), 2);
}

#[test]
fn test_shutdown_disconnects_idle_clients() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);

    // The handler blocks reading a request that never comes.
    let mut idle = TcpStream::connect(proxy.addr()).unwrap();
    idle.set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    thread::sleep(Duration::from_millis(100));

    proxy.stop();

    let mut response = Vec::new();
    idle.read_to_end(&mut response).unwrap();
    assert!(response.is_empty());
}

#[test]
fn test_shutdown_while_waiting_for_slot() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::with_config(Config {
        max_connections: 1,
        ..crate::config(&origin)
    });

    // Occupy the only slot, then make the accept loop wait for it.
    let _idle = TcpStream::connect(proxy.addr()).unwrap();
    thread::sleep(Duration::from_millis(100));
    let _waiting = TcpStream::connect(proxy.addr()).unwrap();
    thread::sleep(Duration::from_millis(100));

    proxy.stop();
}

#[test]
fn test_shutdown_waits_for_loads() {
    crate::setup();

    let origin = Origin::builder()
        .body("HELLO")
        .delay(Duration::from_millis(200))
        .start();
    let proxy = TestProxy::new(&origin);
    let url = "http://example.com/x";
    let pinned = proxy.cache().acquire(url).unwrap();

    let client = {
        let addr = proxy.addr();
        thread::spawn(move || cacheproxy_test::get(addr, url))
    };

    // Stop only once the load is underway.
    let deadline = Instant::now() + Duration::from_secs(10);
    while origin.requests().is_empty() {
        assert!(Instant::now() < deadline, "origin never received the request");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(pinned.state(), EntryState::Loading);

    proxy.stop();

    assert_eq!(pinned.state(), EntryState::Done);
    assert_eq!(pinned.data().as_deref(), Some(&b"HELLO"[..]));
    let _ = client.join();
}
