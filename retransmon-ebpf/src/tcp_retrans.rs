//! `tcp/tcp_retransmit_skb` tracepoint.
//!
//! The args layout below is hand-derived from
//! `/sys/kernel/debug/tracing/events/tcp/tcp_retransmit_skb/format` and is
//! mapped onto the context without any runtime check. On a kernel whose
//! format differs, the program keeps running and emits wrong values.

use core::{
    ffi::c_void,
    mem::{offset_of, size_of},
};

use aya_ebpf::{
    EbpfContext,
    bindings::BPF_F_CURRENT_CPU,
    helpers::{
        bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_perf_event_output, bpf_probe_read_kernel,
    },
    macros::{map, tracepoint},
    maps::PerfEventArray,
    programs::TracePointContext,
};
use retransmon_common::{
    EventSink, RetransmitContext, RetransmitFields, TcpRetransEvent, capture,
};

#[map]
static TCP_RETRANS_EVENTS: PerfEventArray<TcpRetransEvent> = PerfEventArray::new(0);

#[repr(C)]
#[allow(dead_code)]
struct TcpRetransmitSkbArgs {
    common_type: u16,
    common_flags: u8,
    common_preempt_count: u8,
    common_pid: i32,
    skbaddr: u64,
    skaddr: u64,
    state: i32,
    sport: u16,
    dport: u16,
    family: u16,
    saddr: [u8; 4],
    daddr: [u8; 4],
    saddr_v6: [u8; 16],
    daddr_v6: [u8; 16],
}

// Offsets from the tracefs `format` file.
const _: () = {
    assert!(offset_of!(TcpRetransmitSkbArgs, skbaddr) == 8);
    assert!(offset_of!(TcpRetransmitSkbArgs, skaddr) == 16);
    assert!(offset_of!(TcpRetransmitSkbArgs, state) == 24);
    assert!(offset_of!(TcpRetransmitSkbArgs, sport) == 28);
    assert!(offset_of!(TcpRetransmitSkbArgs, dport) == 30);
    assert!(offset_of!(TcpRetransmitSkbArgs, family) == 32);
    assert!(offset_of!(TcpRetransmitSkbArgs, saddr) == 34);
    assert!(offset_of!(TcpRetransmitSkbArgs, daddr) == 38);
    assert!(offset_of!(TcpRetransmitSkbArgs, saddr_v6) == 42);
    assert!(offset_of!(TcpRetransmitSkbArgs, daddr_v6) == 58);
    assert!(size_of::<TcpRetransmitSkbArgs>() == 80);
};

#[tracepoint]
pub fn tcp_retransmit_skb(ctx: TracePointContext) -> u32 {
    capture(&RetransmitSkb(&ctx), &PerfChannel(&ctx))
}

struct RetransmitSkb<'a>(&'a TracePointContext);

impl RetransmitSkb<'_> {
    #[inline(always)]
    fn args(&self) -> *const TcpRetransmitSkbArgs {
        self.0.as_ptr() as *const TcpRetransmitSkbArgs
    }
}

impl RetransmitContext for RetransmitSkb<'_> {
    #[inline(always)]
    fn timestamp_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn current_pid(&self) -> u32 {
        (bpf_get_current_pid_tgid() >> 32) as u32
    }

    #[inline(always)]
    fn fields(&self) -> RetransmitFields {
        let args = self.args();
        unsafe {
            RetransmitFields {
                sport: (*args).sport,
                dport: (*args).dport,
                family: (*args).family,
                state: (*args).state,
            }
        }
    }

    #[inline(always)]
    fn saddr_v4(&self) -> Result<[u8; 4], i64> {
        unsafe { bpf_probe_read_kernel(&raw const (*self.args()).saddr) }
    }

    #[inline(always)]
    fn daddr_v4(&self) -> Result<[u8; 4], i64> {
        unsafe { bpf_probe_read_kernel(&raw const (*self.args()).daddr) }
    }

    #[inline(always)]
    fn saddr_v6(&self) -> Result<[u8; 16], i64> {
        unsafe { bpf_probe_read_kernel(&raw const (*self.args()).saddr_v6) }
    }

    #[inline(always)]
    fn daddr_v6(&self) -> Result<[u8; 16], i64> {
        unsafe { bpf_probe_read_kernel(&raw const (*self.args()).daddr_v6) }
    }
}

/// Writes into the current CPU's slot of `TCP_RETRANS_EVENTS`.
///
/// Calls the helper directly rather than `PerfEventArray::output`, which
/// discards the status. A full buffer comes back as a negative errno.
struct PerfChannel<'a>(&'a TracePointContext);

impl EventSink for PerfChannel<'_> {
    #[inline(always)]
    fn publish(&self, event: &TcpRetransEvent) -> Result<(), i64> {
        // PerfEventArray is repr(transparent) over its map definition.
        let ret = unsafe {
            bpf_perf_event_output(
                self.0.as_ptr(),
                &raw const TCP_RETRANS_EVENTS as *mut c_void,
                BPF_F_CURRENT_CPU as u64,
                event as *const TcpRetransEvent as *mut c_void,
                size_of::<TcpRetransEvent>() as u64,
            )
        };
        if ret < 0 { Err(ret) } else { Ok(()) }
    }
}
