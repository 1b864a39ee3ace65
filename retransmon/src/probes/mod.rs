use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::perf::PerfEventArray,
    programs::TracePoint,
    util::online_cpus,
};
use bytes::BytesMut;
use log::{info, warn};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod tcp_retrans;

pub trait Probe {
    /// Returns `false` when the probe was skipped because the host lacks its
    /// attachment point.
    fn attach(&self, bpf: &mut Ebpf) -> Result<bool>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

/// Samples pulled from one CPU buffer per read.
const READ_BATCH: usize = 16;

const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

fn tracepoint_exists(category: &str, name: &str) -> bool {
    tracepoint_exists_in(&TRACEFS_MOUNT_POINTS, category, name)
}

fn tracepoint_exists_in<P: AsRef<Path>>(roots: &[P], category: &str, name: &str) -> bool {
    roots.iter().any(|base| {
        base.as_ref()
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}:{}", config.category, config.name))?;
    info!("Attached tracepoint: {}/{}", config.category, config.name);
    Ok(true)
}

/// Opens one perf buffer per online CPU and drains each on a blocking task.
///
/// Each CPU writes to its own buffer, so records from different CPUs reach
/// `on_sample` in no particular order. `on_lost` receives the number of
/// records the kernel dropped because that buffer was full.
pub fn spawn_perf_handler<S, L>(
    bpf: &mut Ebpf,
    map_name: &str,
    page_count: Option<usize>,
    record_size: usize,
    on_sample: S,
    on_lost: L,
) -> Result<()>
where
    S: Fn(u32, &[u8]) + Clone + Send + 'static,
    L: Fn(u32, usize) + Clone + Send + 'static,
{
    let mut perf_array = PerfEventArray::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to find {} map", map_name))?,
    )?;

    let cpus = online_cpus()
        .map_err(|(path, e)| anyhow::anyhow!("Failed to read online CPUs from {}: {}", path, e))?;

    for cpu_id in cpus {
        let mut buf = perf_array
            .open(cpu_id, page_count)
            .with_context(|| format!("Failed to open perf buffer for CPU {}", cpu_id))?;
        let shutdown = shutdown_flag();
        let on_sample = on_sample.clone();
        let on_lost = on_lost.clone();

        tokio::task::spawn_blocking(move || {
            let mut buffers = (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(record_size))
                .collect::<Vec<_>>();

            while !shutdown.load(Ordering::Relaxed) {
                if !buf.readable() {
                    std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                    continue;
                }

                match buf.read_events(&mut buffers) {
                    Ok(events) => {
                        on_lost(cpu_id, events.lost);
                        for sample in buffers.iter().take(events.read) {
                            on_sample(cpu_id, sample);
                        }
                    }
                    Err(e) => {
                        warn!("[CPU {}] perf buffer read failed: {}", cpu_id, e);
                        break;
                    }
                }
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracepoint_lookup_walks_all_mount_points() {
        let missing = tempfile::tempdir().unwrap();
        let tracefs = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tracefs.path().join("events/tcp/tcp_retransmit_skb")).unwrap();

        let roots = [missing.path(), tracefs.path()];
        assert!(tracepoint_exists_in(&roots, "tcp", "tcp_retransmit_skb"));
        assert!(!tracepoint_exists_in(&roots, "tcp", "tcp_probe"));
        assert!(!tracepoint_exists_in(&roots[..1], "tcp", "tcp_retransmit_skb"));
    }

    #[test]
    fn shutdown_flag_is_shared() {
        let flag = shutdown_flag();
        request_shutdown();
        assert!(flag.load(Ordering::Relaxed));
        SHUTDOWN.store(false, Ordering::Relaxed);
    }
}
