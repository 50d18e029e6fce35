//! Statsd reporting of cache metrics.
//!
//! Nothing is reported until [`init`] found a `statsd` host in the [`Config`]. Until then the
//! [`metric!`](crate::metric) macro is a no-op.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

use crate::config::Config;

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

thread_local! {
    static THREAD_CLIENT: Option<&'static MetricsClient> = CLIENT.get();
}

/// Traits needed by the [`metric!`](crate::metric) macro.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches the configured custom tags to everything it sends.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    custom_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, builder: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.custom_tags
            .iter()
            .fold(builder, |builder, (key, value)| builder.with_tag(key, value))
            .send()
    }
}

/// Starts reporting to the statsd host of `config`, if one is configured.
///
/// Must be called once at startup, before the cache is constructed. Threads that emitted a
/// metric earlier keep reporting nothing.
pub fn init(config: &Config) -> io::Result<()> {
    let Some(statsd) = &config.metrics.statsd else {
        tracing::debug!("No statsd host configured, metrics are disabled");
        return Ok(());
    };
    configure_statsd(
        &config.metrics.prefix,
        statsd.as_str(),
        config.metrics.custom_tags.clone(),
    )
}

/// Installs the global statsd client reporting to `host`.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    custom_tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "statsd host did not resolve",
        ));
    };
    tracing::info!("Reporting metrics to statsd at {}", addr);

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    CLIENT
        .set(MetricsClient {
            statsd: StatsdClient::from_sink(prefix, sink),
            custom_tags,
        })
        .map_err(|_| io::Error::other("statsd client already configured"))
}

/// Calls `f` with the statsd client of this thread, or returns the default if there is none.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    THREAD_CLIENT.with(|client| (*client).map(f).unwrap_or_default())
}

/// Emits a metric.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().histogram_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_without_statsd() {
        let mut config = Config::default();
        config.metrics.statsd = None;

        init(&config).unwrap();
        assert!(CLIENT.get().is_none());

        // metrics are silently dropped
        metric!(counter("caches.access") += 1);
    }

    #[test]
    fn test_unresolvable_host() {
        let no_addrs: &[std::net::SocketAddr] = &[];
        let err = configure_statsd("thumbcache", no_addrs, BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(CLIENT.get().is_none());
    }
}
