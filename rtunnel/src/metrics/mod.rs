use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

pub mod metric;

pub use metric::register_counter;
pub use metric::register_gauge;
pub use metric::Tag;

/// Serve the registry at `http://{addr}/metrics`.
pub fn install(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow!("install prometheus exporter on {} error. {}", addr, e))?;

    info!("metrics prometheus http exporter listen on http://{}", addr);
    Ok(())
}

pub fn init_metrics(address: &str) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("failed to parse metrics listen address {}. {}", address, e))?;
    install(addr)?;
    Ok(addr)
}

/// Periodically push the registry into the exporter until `running` is cleared.
pub(crate) fn spawn_reporter(
    interval: Duration,
    running: Arc<AtomicBool>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    crate::utils::thread::spawn("Metrics-reporter", move || {
        while running.load(Ordering::SeqCst) {
            metric::compute();
            crate::utils::thread::sleep_while(interval, || running.load(Ordering::SeqCst));
        }
    })
}
