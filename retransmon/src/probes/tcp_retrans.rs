//! TCP retransmission probe.
//!
//! Attaches `tcp_retransmit_skb` from the eBPF object to the
//! `tcp/tcp_retransmit_skb` tracepoint and feeds every record from the
//! `TCP_RETRANS_EVENTS` perf array into the [`Collector`].

use std::sync::Arc;

use anyhow::Result;
use aya::Ebpf;
use log::info;
use retransmon_common::TCP_RETRANS_EVENT_SIZE;

use crate::collector::Collector;
use crate::probes::{Probe, TracepointConfig, attach_tracepoint, spawn_perf_handler};
use crate::telemetry;

pub const PROGRAM_NAME: &str = "tcp_retransmit_skb";
pub const EVENTS_MAP: &str = "TCP_RETRANS_EVENTS";

pub struct TcpRetransProbe {
    collector: Arc<Collector>,
    page_count: Option<usize>,
}

impl TcpRetransProbe {
    pub fn new(collector: Arc<Collector>, page_count: Option<usize>) -> Self {
        Self {
            collector,
            page_count,
        }
    }
}

impl Probe for TcpRetransProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<bool> {
        let attached = attach_tracepoint(
            bpf,
            TracepointConfig {
                program_name: PROGRAM_NAME,
                category: "tcp",
                name: "tcp_retransmit_skb",
            },
        )?;
        if !attached {
            return Ok(false);
        }

        let on_sample = {
            let collector = self.collector.clone();
            move |cpu: u32, sample: &[u8]| {
                collector.handle_sample(cpu, sample);
            }
        };
        let on_lost = {
            let collector = self.collector.clone();
            move |cpu: u32, lost: usize| collector.handle_lost(cpu, lost)
        };

        spawn_perf_handler(
            bpf,
            EVENTS_MAP,
            self.page_count,
            TCP_RETRANS_EVENT_SIZE,
            on_sample,
            on_lost,
        )?;

        telemetry::record_active_probe("tcp_retrans", 1);
        info!("TcpRetransProbe attached successfully");

        Ok(true)
    }
}
