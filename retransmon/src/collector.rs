//! Turns raw `TcpRetransEvent` records into labelled retransmissions.
//!
//! Records arrive per CPU in whatever order the perf buffers are drained.
//! Nothing here reorders them; sort on `timestamp` if causality matters.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use retransmon_common::{AF_INET, AF_INET6, TcpRetransEvent};
use serde::Serialize;

use crate::metrics::RetransMetrics;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
    /// `family` was neither `AF_INET` nor `AF_INET6`. The probe still emits
    /// these, with zeroed addresses.
    Unknown,
}

impl IpVersion {
    pub fn from_family(family: u16) -> Self {
        match family {
            AF_INET => Self::V4,
            AF_INET6 => Self::V6,
            _ => Self::Unknown,
        }
    }

    pub fn as_number(self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
            Self::Unknown => 0,
        }
    }
}

/// Converts `bpf_ktime_get_ns` (CLOCK_MONOTONIC) to wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    /// CLOCK_REALTIME minus CLOCK_MONOTONIC, in ns.
    offset_ns: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            offset_ns: clock_ns(libc::CLOCK_REALTIME) - clock_ns(libc::CLOCK_MONOTONIC),
        }
    }

    pub fn with_offset(offset_ns: i64) -> Self {
        Self { offset_ns }
    }

    pub fn to_wall_clock(&self, ktime_ns: u64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos((ktime_ns as i64).saturating_add(self.offset_ns))
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

fn clock_ns(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime cannot fail for these clock ids with a valid pointer.
    unsafe { libc::clock_gettime(clock, &mut ts) };
    (ts.tv_sec as i64) * 1_000_000_000 + ts.tv_nsec as i64
}

/// A decoded retransmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Retransmit {
    pub time: DateTime<Utc>,
    pub pid: u32,
    pub state: i32,
    pub ip_version: IpVersion,
    pub saddr: Option<IpAddr>,
    pub daddr: Option<IpAddr>,
    pub sport: u16,
    pub dport: u16,
}

impl Retransmit {
    pub fn from_event(event: &TcpRetransEvent, clock: &MonotonicClock) -> Self {
        let ip_version = IpVersion::from_family(event.family);
        let (saddr, daddr) = match ip_version {
            IpVersion::V4 => (
                Some(IpAddr::V4(Ipv4Addr::from(event.saddr))),
                Some(IpAddr::V4(Ipv4Addr::from(event.daddr))),
            ),
            IpVersion::V6 => (
                Some(IpAddr::V6(Ipv6Addr::from(event.saddr_v6))),
                Some(IpAddr::V6(Ipv6Addr::from(event.daddr_v6))),
            ),
            IpVersion::Unknown => (None, None),
        };

        Self {
            time: clock.to_wall_clock(event.timestamp),
            pid: event.pid,
            state: event.state,
            ip_version,
            saddr,
            daddr,
            sport: event.sport,
            dport: event.dport,
        }
    }

    pub fn src_ip(&self) -> String {
        self.saddr.map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn dst_ip(&self) -> String {
        self.daddr.map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn tcp_state(&self) -> &'static str {
        tcp_state_name(self.state)
    }

    pub fn report(&self) -> RetransmitReport {
        RetransmitReport {
            timestamp: self.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            pid: self.pid,
            state: self.state,
            tcp_state: self.tcp_state(),
            ipversion: self.ip_version.as_number(),
            source: Endpoint {
                ip: self.src_ip(),
                port: self.sport,
            },
            destination: Endpoint {
                ip: self.dst_ip(),
                port: self.dport,
            },
        }
    }
}

/// JSON line written per retransmission.
#[derive(Debug, Serialize)]
pub struct RetransmitReport {
    pub timestamp: String,
    pub pid: u32,
    pub state: i32,
    pub tcp_state: &'static str,
    pub ipversion: u8,
    pub source: Endpoint,
    pub destination: Endpoint,
}

#[derive(Debug, Serialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

pub fn tcp_state_name(state: i32) -> &'static str {
    match state {
        1 => "ESTABLISHED",
        2 => "SYN_SENT",
        3 => "SYN_RECV",
        4 => "FIN_WAIT1",
        5 => "FIN_WAIT2",
        6 => "TIME_WAIT",
        7 => "CLOSE",
        8 => "CLOSE_WAIT",
        9 => "LAST_ACK",
        10 => "LISTEN",
        11 => "CLOSING",
        12 => "NEW_SYN_RECV",
        _ => "UNKNOWN",
    }
}

/// Shared by every per-CPU reader.
pub struct Collector {
    clock: MonotonicClock,
    metrics: Option<Arc<RetransMetrics>>,
    json_output: bool,
}

impl Collector {
    pub fn new(clock: MonotonicClock, metrics: Option<Arc<RetransMetrics>>, json_output: bool) -> Self {
        Self {
            clock,
            metrics,
            json_output,
        }
    }

    /// Decodes one raw perf sample and records it.
    pub fn handle_sample(&self, cpu: u32, sample: &[u8]) -> Option<Retransmit> {
        let Some(event) = TcpRetransEvent::from_bytes(sample) else {
            warn!(
                "[CPU {}] dropping short sample ({} bytes, expected {})",
                cpu,
                sample.len(),
                retransmon_common::TCP_RETRANS_EVENT_SIZE
            );
            return None;
        };
        Some(self.handle_event(&event))
    }

    pub fn handle_event(&self, event: &TcpRetransEvent) -> Retransmit {
        let retransmit = Retransmit::from_event(event, &self.clock);

        debug!(
            "TCP_RETRANS pid={} {}:{} -> {}:{} state={} family={}",
            retransmit.pid,
            retransmit.src_ip(),
            retransmit.sport,
            retransmit.dst_ip(),
            retransmit.dport,
            retransmit.tcp_state(),
            event.family,
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_retransmit(&retransmit);
        }
        telemetry::record_tcp_retrans_event(&retransmit);

        if self.json_output {
            match serde_json::to_string(&retransmit.report()) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode retransmit report: {}", e),
            }
        }

        retransmit
    }

    /// Samples the kernel could not fit into a CPU's perf buffer.
    pub fn handle_lost(&self, cpu: u32, lost: usize) {
        if lost == 0 {
            return;
        }
        warn!("[CPU {}] {} retransmit events lost (perf buffer full)", cpu, lost);
        if let Some(metrics) = &self.metrics {
            metrics.record_lost(cpu, lost as u64);
        }
    }
}
