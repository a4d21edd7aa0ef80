//! Locating the origin server of a cached URL.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use crate::cache::LoadError;

/// The origin host and path of an absolute request URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginTarget<'a> {
    /// Host name without scheme or port.
    pub host: &'a str,
    /// The path to request, always starting with `/`.
    pub path: &'a str,
}

impl<'a> OriginTarget<'a> {
    /// Splits a request URL into origin host and path.
    ///
    /// A leading `scheme://` is stripped and the host ends at the first `/` (the path defaults to
    /// `/`). Everything from the first `:` of the host on is dropped, whatever follows it, as
    /// origins are always contacted on the configured upstream port.
    pub fn parse(url: &'a str) -> Result<Self, LoadError> {
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if is_scheme(scheme) => rest,
            _ => url,
        };

        let (authority, path) = match rest.find('/') {
            Some(slash) => rest.split_at(slash),
            None => (rest, "/"),
        };

        let host = authority
            .split_once(':')
            .map_or(authority, |(host, _port)| host);

        if host.is_empty() {
            return Err(LoadError::InvalidUrl(url.to_owned()));
        }

        Ok(Self { host, path })
    }

    /// Renders the request sent to the origin.
    pub fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path, self.host
        )
    }
}

fn is_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Resolves origin host names to IPv4 addresses.
pub trait Resolver: fmt::Debug + Send + Sync {
    fn resolve(&self, host: &str) -> io::Result<Ipv4Addr>;
}

/// Resolves hosts through the operating system, picking the first IPv4 address.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Ipv4Addr> {
        (host, 0)
            .to_socket_addrs()?
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no IPv4 address for `{host}`"),
                )
            })
    }
}

/// Resolves every host to the same address.
///
/// This routes all origin traffic to a single upstream, such as a parent proxy or a test server.
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver(pub Ipv4Addr);

impl Resolver for StaticResolver {
    fn resolve(&self, _host: &str) -> io::Result<Ipv4Addr> {
        Ok(self.0)
    }
}
