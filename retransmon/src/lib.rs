pub mod collector;
pub mod metrics;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use aya::Ebpf;
use log::{info, warn};
use tokio::signal;

use crate::collector::{Collector, MonotonicClock};
use crate::metrics::RetransMetrics;
use crate::probes::{Probe, request_shutdown, tcp_retrans::TcpRetransProbe};
use crate::settings::Settings;

pub struct RetransmonEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl RetransmonEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let bpf = Ebpf::load(bytecode).context("Failed to load eBPF object")?;
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        let metrics = if self.settings.metrics.enabled {
            Some(Arc::new(RetransMetrics::new()?))
        } else {
            None
        };

        let collector = Arc::new(Collector::new(
            MonotonicClock::new(),
            metrics.clone(),
            self.settings.json_output,
        ));

        let probe = TcpRetransProbe::new(collector, self.settings.perf.page_count);
        if !probe.attach(&mut self.bpf)? {
            bail!("tcp/tcp_retransmit_skb tracepoint is not available on this kernel");
        }

        let server = match metrics {
            Some(metrics) => {
                let addr = self.settings.metrics_addr()?;
                let (_, server) = crate::metrics::bind(metrics, addr)
                    .with_context(|| format!("Failed to bind metrics endpoint {}", addr))?;
                Some(tokio::spawn(server))
            }
            None => None,
        };

        info!("Monitoring TCP retransmissions. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        request_shutdown();
        if let Some(server) = server {
            server.abort();
        }

        Ok(())
    }
}

// eBPF maps are stored in locked kernel memory. Older kernels charge them
// against RLIMIT_MEMLOCK.
fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
