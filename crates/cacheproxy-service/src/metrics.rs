//! Statsd metrics reported by the proxy.
//!
//! Nothing is sent until [`configure_statsd`] ran; until then [`metric!`](crate::metric) is a
//! no-op.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Internal prelude for the macro
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// A statsd client adding the configured custom tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    pub fn send<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        tags,
    };
    if METRICS_CLIENT.set(client).is_err() {
        tracing::warn!("statsd client was already configured");
    } else if let Some(addr) = addrs.first() {
        tracing::info!("reporting metrics to statsd at {}", addr);
    }

    Ok(())
}

/// Calls `f` with the statsd client, if one is configured.
pub fn with_client<F: FnOnce(&MetricsClient)>(f: F) {
    if let Some(client) = METRICS_CLIENT.get() {
        f(client);
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("requests") += 1, "outcome" => "served");
/// metric!(gauge("cache.entries") = 3);
/// metric!(timer("loader.duration") = start.elapsed());
/// metric!(histogram("loader.bytes") = 512);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };

    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::_pred::*;
        $crate::metrics::with_client(|client| {
            client.send(client.statsd().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[test]
    fn test_metrics_without_client() {
        // Every arm expands and is silently dropped while statsd is not configured.
        metric!(counter("requests") += 1, "outcome" => "served");
        metric!(gauge("cache.entries") = 3u64);
        metric!(timer("loader.duration") = Duration::from_millis(5), "status" => "done");
        metric!(histogram("loader.bytes") = 512u64);
    }
}
