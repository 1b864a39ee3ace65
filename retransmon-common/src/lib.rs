#![no_std]

#[cfg(test)]
extern crate std;

pub mod capture;

pub use capture::{EventSink, RetransmitContext, RetransmitFields, capture};

/// `AF_INET` as numbered by the host kernel.
pub const AF_INET: u16 = 2;
/// `AF_INET6` as numbered by the host kernel.
pub const AF_INET6: u16 = 10;

/// Size of [`TcpRetransEvent`] on the wire, padding included.
pub const TCP_RETRANS_EVENT_SIZE: usize = 64;

/// One TCP retransmission, as published by the tracepoint program.
///
/// Host byte order, natural alignment. The collector decodes with this exact
/// layout; there is no version tag, so both sides change together.
///
/// Only the address pair selected by `family` carries data. The other pair is
/// zero, and both are zero when `family` is neither [`AF_INET`] nor
/// [`AF_INET6`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpRetransEvent {
    /// `bpf_ktime_get_ns` at capture time.
    pub timestamp: u64,
    /// Tgid of whatever task was on the CPU. Timer-driven retransmits
    /// report an unrelated task (often 0).
    pub pid: u32,
    pub sport: u16,
    pub dport: u16,
    pub saddr: [u8; 4],
    pub daddr: [u8; 4],
    pub saddr_v6: [u8; 16],
    pub daddr_v6: [u8; 16],
    pub family: u16,
    /// Always zero. Named so that every byte of the record is initialised.
    pub _pad: [u8; 2],
    /// Raw kernel `TCP_*` state code.
    pub state: i32,
}

const _: () = assert!(core::mem::size_of::<TcpRetransEvent>() == TCP_RETRANS_EVENT_SIZE);

impl TcpRetransEvent {
    /// Assembles the record, reading only the address pair that
    /// `fields.family` selects.
    ///
    /// A failed address read leaves that address zeroed. Never fails.
    #[inline(always)]
    pub fn build<C: RetransmitContext>(
        timestamp: u64,
        pid: u32,
        fields: RetransmitFields,
        ctx: &C,
    ) -> Self {
        let mut event = Self {
            timestamp,
            pid,
            sport: fields.sport,
            dport: fields.dport,
            family: fields.family,
            _pad: [0; 2],
            state: fields.state,
            ..Self::default()
        };

        match fields.family {
            AF_INET => {
                event.saddr = ctx.saddr_v4().unwrap_or([0; 4]);
                event.daddr = ctx.daddr_v4().unwrap_or([0; 4]);
            }
            AF_INET6 => {
                event.saddr_v6 = ctx.saddr_v6().unwrap_or([0; 16]);
                event.daddr_v6 = ctx.daddr_v6().unwrap_or([0; 16]);
            }
            _ => {}
        }

        event
    }

    /// Reads a record out of a raw perf sample. `None` if the sample is
    /// shorter than the wire size.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TCP_RETRANS_EVENT_SIZE {
            return None;
        }
        // Every bit pattern is a valid TcpRetransEvent.
        Some(unsafe { (bytes.as_ptr() as *const Self).read_unaligned() })
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TcpRetransEvent {}
