use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cacheproxy_test::Origin;

use crate::{BAD_GATEWAY, TestProxy};

const CLIENTS: usize = 32;

/// Sends `CLIENTS` concurrent requests for `url` and returns all responses.
fn concurrent_gets(proxy: &TestProxy, url: &str) -> Vec<Vec<u8>> {
    let barrier = Arc::new(Barrier::new(CLIENTS));
    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let addr = proxy.addr();
            let url = url.to_owned();
            thread::spawn(move || {
                barrier.wait();
                cacheproxy_test::get(addr, &url)
            })
        })
        .collect();

    clients
        .into_iter()
        .map(|client| client.join().unwrap())
        .collect()
}

#[test]
fn test_concurrent_requests_share_one_load() {
    crate::setup();

    let origin = Origin::builder()
        .body("HTTP/1.0 200 OK\r\n\r\nslow")
        .delay(Duration::from_millis(500))
        .start();
    let proxy = TestProxy::new(&origin);

    let responses = concurrent_gets(&proxy, "http://example.com/slow");

    assert_eq!(responses.len(), CLIENTS);
    for response in &responses {
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nslow");
    }
    assert_eq!(origin.connections(), 1);

    // Every handler released its entry before closing its client.
    assert!(proxy.cache().is_empty());
}

#[test]
fn test_concurrent_requests_share_one_failure() {
    crate::setup();

    let origin = Origin::builder()
        .close()
        .delay(Duration::from_millis(500))
        .start();
    let proxy = TestProxy::new(&origin);

    let responses = concurrent_gets(&proxy, "http://example.com/broken");

    for response in &responses {
        assert_eq!(response, BAD_GATEWAY);
    }
    assert_eq!(origin.connections(), 1);
    assert!(proxy.cache().is_empty());
}

#[test]
fn test_distinct_urls_load_independently() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);

    let clients: Vec<_> = (0..8)
        .map(|i| {
            let addr = proxy.addr();
            thread::spawn(move || cacheproxy_test::get(addr, &format!("http://example.com/{i}")))
        })
        .collect();
    for client in clients {
        assert_eq!(client.join().unwrap(), b"HELLO");
    }

    assert_eq!(origin.connections(), 8);
    assert!(proxy.cache().is_empty());
}
