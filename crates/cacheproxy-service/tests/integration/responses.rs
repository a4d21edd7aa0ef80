use std::sync::Arc;

use cacheproxy_test::Origin;

use crate::{BAD_GATEWAY, BAD_REQUEST, METHOD_NOT_ALLOWED, TestProxy, UnknownHosts};

#[test]
fn test_round_trip() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);
    let url = "http://example.com/x";

    // Keep the entry referenced so the second request is served from the cache.
    let pinned = proxy.cache().acquire(url).unwrap();

    assert_eq!(proxy.get(url), b"HELLO");
    assert_eq!(proxy.get(url), b"HELLO");
    assert_eq!(origin.connections(), 1);
    assert_eq!(
        origin.requests(),
        vec!["GET /x HTTP/1.0\r\nHost: example.com\r\nConnection: close\r\n\r\n"]
    );

    drop(pinned);
    assert!(proxy.cache().is_empty());
}

#[test]
fn test_unreferenced_entry_is_refetched() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);

    assert_eq!(proxy.get("http://example.com/x"), b"HELLO");
    assert!(proxy.cache().is_empty());
    assert_eq!(proxy.get("http://example.com/x"), b"HELLO");
    assert_eq!(origin.connections(), 2);
}

#[test]
fn test_large_response() {
    crate::setup();

    let body: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let origin = Origin::serve(body.clone());
    let proxy = TestProxy::new(&origin);

    let response = proxy.get("http://example.com/large");
    assert_eq!(response.len(), body.len());
    assert!(response == body);
}

#[test]
fn test_bad_request() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);

    let response = proxy.send(b"GET http://example.com/x\r\nHost: example.com\r\n\r\n");
    assert_eq!(response, BAD_REQUEST);
    assert!(proxy.cache().is_empty());
    assert_eq!(origin.connections(), 0);
}

#[test]
fn test_method_not_allowed() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);

    let response = proxy.send(b"POST http://example.com/x HTTP/1.0\r\n\r\n");
    assert_eq!(response, METHOD_NOT_ALLOWED);
    assert!(proxy.cache().is_empty());
    assert!(!proxy.cache().contains("http://example.com/x"));
    assert_eq!(origin.connections(), 0);
}

#[test]
fn test_empty_request_gets_no_response() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::new(&origin);

    // Connect and close the write half without sending anything.
    let mut stream = std::net::TcpStream::connect(proxy.addr()).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let mut response = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut response).unwrap();

    assert!(response.is_empty());
}

#[test]
fn test_origin_closes_without_response() {
    crate::setup();

    let origin = Origin::builder().close().start();
    let proxy = TestProxy::new(&origin);

    assert_eq!(proxy.get("http://example.com/x"), BAD_GATEWAY);
    assert_eq!(origin.connections(), 1);
}

#[test]
fn test_unresolvable_host() {
    crate::setup();

    let origin = Origin::serve("HELLO");
    let proxy = TestProxy::with_resolver(crate::config(&origin), Arc::new(UnknownHosts));

    assert_eq!(proxy.get("http://nowhere.invalid/"), BAD_GATEWAY);
    assert_eq!(origin.connections(), 0);
}

#[test]
fn test_failed_entry_stays_failed_while_referenced() {
    crate::setup();

    let origin = Origin::builder().close().start();
    let proxy = TestProxy::new(&origin);
    let url = "http://example.com/x";

    let pinned = proxy.cache().acquire(url).unwrap();
    assert_eq!(proxy.get(url), BAD_GATEWAY);
    assert_eq!(proxy.get(url), BAD_GATEWAY);
    assert_eq!(origin.connections(), 1);

    drop(pinned);
    assert_eq!(proxy.get(url), BAD_GATEWAY);
    assert_eq!(origin.connections(), 2);
}
