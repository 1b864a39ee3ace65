#![no_std]
#![no_main]

mod tcp_retrans;

// The kernel refuses GPL-only helpers (bpf_probe_read_kernel,
// bpf_perf_event_output) without a GPL-compatible license section.
#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
