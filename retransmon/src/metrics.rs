//! Prometheus scrape endpoint.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};
use prometheus::{CounterVec, Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use warp::Filter;

use crate::collector::Retransmit;

const RETRANS_LABELS: [&str; 6] = ["ip_version", "src_ip", "src_port", "dst_ip", "dst_port", "state"];

pub struct RetransMetrics {
    registry: Registry,
    retransmissions: CounterVec,
    lost_samples: IntCounterVec,
}

impl RetransMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let retransmissions = CounterVec::new(
            Opts::new("tcp_retransmissions_total", "Total number of TCP retransmissions"),
            &RETRANS_LABELS,
        )?;
        let lost_samples = IntCounterVec::new(
            Opts::new(
                "tcp_retransmit_lost_samples_total",
                "Retransmit records the kernel dropped because a perf buffer was full",
            ),
            &["cpu"],
        )?;

        registry.register(Box::new(retransmissions.clone()))?;
        registry.register(Box::new(lost_samples.clone()))?;

        Ok(Self {
            registry,
            retransmissions,
            lost_samples,
        })
    }

    pub fn record_retransmit(&self, r: &Retransmit) {
        let ip_version = r.ip_version.as_number().to_string();
        let src_ip = r.src_ip();
        let src_port = r.sport.to_string();
        let dst_ip = r.dst_ip();
        let dst_port = r.dport.to_string();

        self.retransmissions
            .with_label_values(&[
                ip_version.as_str(),
                src_ip.as_str(),
                src_port.as_str(),
                dst_ip.as_str(),
                dst_port.as_str(),
                r.tcp_state(),
            ])
            .inc();
    }

    pub fn record_lost(&self, cpu: u32, count: u64) {
        self.lost_samples
            .with_label_values(&[cpu.to_string().as_str()])
            .inc_by(count);
    }

    /// Text exposition of every registered metric.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub fn retransmissions(&self, labels: &[&str]) -> u64 {
        self.retransmissions.with_label_values(labels).get() as u64
    }

    #[cfg(test)]
    pub fn lost_samples(&self, cpu: u32) -> u64 {
        self.lost_samples
            .with_label_values(&[cpu.to_string().as_str()])
            .get()
    }
}

/// Binds `GET /metrics` on `addr`.
///
/// Returns the bound address and the server future, which runs until the
/// task driving it is aborted. Must be called inside a tokio runtime.
pub fn bind(
    metrics: Arc<RetransMetrics>,
    addr: SocketAddr,
) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static), warp::Error> {
    let routes = warp::path("metrics").and(warp::get()).map(move || {
        match metrics.gather() {
            Ok(body) => warp::http::Response::builder()
                .header("content-type", "text/plain; version=0.0.4")
                .body(body),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                warp::http::Response::builder()
                    .status(warp::http::StatusCode::INTERNAL_SERVER_ERROR)
                    .body(format!("Error: {}", e))
            }
        }
    });

    let (bound, server) = warp::serve(routes).try_bind_ephemeral(addr)?;
    info!("Prometheus metrics endpoint: http://{}/metrics", bound);
    Ok((bound, server))
}
