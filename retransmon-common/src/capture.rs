//! The per-retransmit capture path: read the tracepoint context, build one
//! [`TcpRetransEvent`], hand it to the output channel.
//!
//! Everything here runs inside the kernel program, so nothing may allocate, block or
//! loop. The two traits exist so the same pipeline runs against the real
//! tracepoint in `retransmon-ebpf` and against fakes in tests.

use crate::TcpRetransEvent;

/// Scalar fields of `tcp/tcp_retransmit_skb`, as the kernel reported them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetransmitFields {
    pub sport: u16,
    pub dport: u16,
    pub family: u16,
    pub state: i32,
}

/// Read access to one `tcp_retransmit_skb` firing: clock, current task,
/// scalar fields and the two address pairs.
///
/// The address reads go through a fault-tolerant copy and may fail; the
/// caller zero-fills on error. Nothing here checks that the tracepoint layout
/// matches the running kernel: a mismatch shows up as wrong values.
pub trait RetransmitContext {
    fn timestamp_ns(&self) -> u64;

    fn current_pid(&self) -> u32;

    fn fields(&self) -> RetransmitFields;

    fn saddr_v4(&self) -> Result<[u8; 4], i64>;

    fn daddr_v4(&self) -> Result<[u8; 4], i64>;

    fn saddr_v6(&self) -> Result<[u8; 16], i64>;

    fn daddr_v6(&self) -> Result<[u8; 16], i64>;
}

/// Output channel for finished records. Non-blocking; a full channel drops
/// the record and reports the negative status it got back.
pub trait EventSink {
    fn publish(&self, event: &TcpRetransEvent) -> Result<(), i64>;
}

/// Runs one capture and returns the tracepoint's return code, which is
/// always 0: publishing is best-effort and never fails the caller.
#[inline(always)]
pub fn capture<C: RetransmitContext, S: EventSink>(ctx: &C, sink: &S) -> u32 {
    let event = TcpRetransEvent::build(ctx.timestamp_ns(), ctx.current_pid(), ctx.fields(), ctx);

    // Dropped records cannot be replayed; the collector sees them as lost samples.
    let _ = sink.publish(&event);

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AF_INET, AF_INET6};
    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    const V4_SRC: [u8; 4] = [192, 168, 1, 10];
    const V4_DST: [u8; 4] = [93, 184, 216, 34];
    const V6_SRC: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    const V6_DST: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

    /// Tracepoint args as the kernel would hand them over. The capture copies
    /// whatever address fields it is told to, so the fake always carries
    /// both pairs to catch reads of the wrong one.
    struct FakeTracepoint {
        clock: Cell<u64>,
        pid: u32,
        fields: RetransmitFields,
        readable: bool,
        v6_reads: Cell<u32>,
        v4_reads: Cell<u32>,
    }

    impl FakeTracepoint {
        fn new(family: u16) -> Self {
            Self {
                clock: Cell::new(1_000),
                pid: 4242,
                fields: RetransmitFields {
                    sport: 51000,
                    dport: 443,
                    family,
                    state: 1,
                },
                readable: true,
                v6_reads: Cell::new(0),
                v4_reads: Cell::new(0),
            }
        }
    }

    impl RetransmitContext for FakeTracepoint {
        fn timestamp_ns(&self) -> u64 {
            let now = self.clock.get();
            self.clock.set(now + 17);
            now
        }

        fn current_pid(&self) -> u32 {
            self.pid
        }

        fn fields(&self) -> RetransmitFields {
            self.fields
        }

        fn saddr_v4(&self) -> Result<[u8; 4], i64> {
            self.v4_reads.set(self.v4_reads.get() + 1);
            if self.readable { Ok(V4_SRC) } else { Err(-14) }
        }

        fn daddr_v4(&self) -> Result<[u8; 4], i64> {
            self.v4_reads.set(self.v4_reads.get() + 1);
            if self.readable { Ok(V4_DST) } else { Err(-14) }
        }

        fn saddr_v6(&self) -> Result<[u8; 16], i64> {
            self.v6_reads.set(self.v6_reads.get() + 1);
            if self.readable { Ok(V6_SRC) } else { Err(-14) }
        }

        fn daddr_v6(&self) -> Result<[u8; 16], i64> {
            self.v6_reads.set(self.v6_reads.get() + 1);
            if self.readable { Ok(V6_DST) } else { Err(-14) }
        }
    }

    /// Bounded channel: accepts up to `capacity` records, drops the rest.
    struct FakeChannel {
        capacity: usize,
        records: RefCell<Vec<TcpRetransEvent>>,
    }

    impl FakeChannel {
        fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity,
                records: RefCell::new(Vec::new()),
            }
        }

        fn drain(&self) -> Vec<TcpRetransEvent> {
            self.records.borrow_mut().drain(..).collect()
        }
    }

    impl EventSink for FakeChannel {
        fn publish(&self, event: &TcpRetransEvent) -> Result<(), i64> {
            let mut records = self.records.borrow_mut();
            if records.len() >= self.capacity {
                return Err(-28);
            }
            records.push(*event);
            Ok(())
        }
    }

    fn capture_one(ctx: &FakeTracepoint) -> TcpRetransEvent {
        let channel = FakeChannel::with_capacity(8);
        assert_eq!(capture(ctx, &channel), 0);
        let mut records = channel.drain();
        assert_eq!(records.len(), 1);
        records.remove(0)
    }

    #[test]
    fn ipv4_retransmit_fills_only_v4_addresses() {
        let ctx = FakeTracepoint::new(AF_INET);
        let event = capture_one(&ctx);

        assert_eq!(event.family, 2);
        assert_eq!(event.sport, 51000);
        assert_eq!(event.dport, 443);
        assert_eq!(event.saddr, V4_SRC);
        assert_eq!(event.daddr, V4_DST);
        assert_eq!(event.saddr_v6, [0; 16]);
        assert_eq!(event.daddr_v6, [0; 16]);
        assert_eq!(event.pid, 4242);
        assert_eq!(event.state, 1);
        assert_eq!(ctx.v6_reads.get(), 0);
    }

    #[test]
    fn ipv6_retransmit_fills_only_v6_addresses() {
        let ctx = FakeTracepoint::new(AF_INET6);
        let event = capture_one(&ctx);

        assert_eq!(event.family, 10);
        assert_eq!(event.saddr_v6, V6_SRC);
        assert_eq!(event.daddr_v6, V6_DST);
        assert_eq!(event.saddr, [0; 4]);
        assert_eq!(event.daddr, [0; 4]);
        assert_eq!(ctx.v4_reads.get(), 0);
    }

    #[test]
    fn unknown_family_is_emitted_with_zero_addresses() {
        let mut ctx = FakeTracepoint::new(1);
        ctx.fields.state = 7;
        let event = capture_one(&ctx);

        assert_eq!(event.family, 1);
        assert_eq!(event.saddr, [0; 4]);
        assert_eq!(event.daddr, [0; 4]);
        assert_eq!(event.saddr_v6, [0; 16]);
        assert_eq!(event.daddr_v6, [0; 16]);
        assert_eq!(event.sport, 51000);
        assert_eq!(event.dport, 443);
        assert_eq!(event.state, 7);
        assert_eq!(event.pid, 4242);
        assert_eq!(ctx.v4_reads.get() + ctx.v6_reads.get(), 0);
    }

    #[test]
    fn failed_address_read_still_emits_zeroed_record() {
        let mut ctx = FakeTracepoint::new(AF_INET6);
        ctx.readable = false;
        let event = capture_one(&ctx);

        assert_eq!(event.family, AF_INET6);
        assert_eq!(event.saddr_v6, [0; 16]);
        assert_eq!(event.daddr_v6, [0; 16]);
        assert_eq!(event.sport, 51000);
    }

    #[test]
    fn full_channel_drops_silently_and_returns_success() {
        let ctx = FakeTracepoint::new(AF_INET);
        let channel = FakeChannel::with_capacity(0);

        assert_eq!(channel.publish(&TcpRetransEvent::default()), Err(-28));
        assert_eq!(capture(&ctx, &channel), 0);
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn channel_keeps_accepting_after_reader_drains() {
        let ctx = FakeTracepoint::new(AF_INET);
        let channel = FakeChannel::with_capacity(1);

        assert_eq!(capture(&ctx, &channel), 0);
        assert_eq!(capture(&ctx, &channel), 0);
        assert_eq!(channel.drain().len(), 1);

        assert_eq!(capture(&ctx, &channel), 0);
        assert_eq!(channel.drain().len(), 1);
    }

    #[test]
    fn timestamps_follow_the_capture_clock() {
        let ctx = FakeTracepoint::new(AF_INET);
        let channel = FakeChannel::with_capacity(16);

        for _ in 0..5 {
            capture(&ctx, &channel);
        }

        let records = channel.drain();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].timestamp, 1_000);
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn record_size_is_fixed_for_every_family() {
        for family in [AF_INET, AF_INET6, 0, 1, u16::MAX] {
            let event = capture_one(&FakeTracepoint::new(family));
            assert_eq!(core::mem::size_of_val(&event), crate::TCP_RETRANS_EVENT_SIZE);
        }
    }
}
