#![no_std]
#![no_main]
#![allow(static_mut_refs)]

use aya_ebpf::{
    bindings::xdp_action,
    helpers::{bpf_ktime_get_ns, bpf_probe_read_kernel},
    macros::{map, tracepoint, xdp},
    maps::{HashMap, PerfEventArray},
    programs::{TracePointContext, XdpContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use core::mem;
use netwatch_common::{
    observe_drop, observe_ingress, ClassifyError, DropBuffer, DropHookLayout, DropSite,
    EventSink, HeaderSource, InterfaceRegistry, PacketEvent, MONITORED_IFS_CAPACITY,
};

#[map(name = "EVENTS")]
static mut EVENTS: PerfEventArray<PacketEvent> = PerfEventArray::<PacketEvent>::new(0);

#[map(name = "MONITORED_IFS")]
static mut MONITORED_IFS: HashMap<u32, u32> =
    HashMap::<u32, u32>::with_max_entries(MONITORED_IFS_CAPACITY, 0);

// Patched by the loader; read through a volatile load so the compiler does
// not fold the defaults in.
#[no_mangle]
static DROP_HOOK_LAYOUT: DropHookLayout = DropHookLayout::DEFAULT;

#[xdp]
pub fn netwatch_ingress(ctx: XdpContext) -> u32 {
    let _ = observe_ingress(&PacketWindow { ctx: &ctx }, &PerfSink { ctx: &ctx }, || unsafe {
        bpf_ktime_get_ns()
    });
    xdp_action::XDP_PASS
}

#[tracepoint]
pub fn netwatch_drop(ctx: TracePointContext) -> u32 {
    match try_netwatch_drop(&ctx) {
        Ok(reason) => {
            debug!(&ctx, "drop observed, reason {}", reason);
            0
        }
        Err(_) => 0,
    }
}

fn try_netwatch_drop(ctx: &TracePointContext) -> Result<u32, ClassifyError> {
    let layout = unsafe { core::ptr::read_volatile(&DROP_HOOK_LAYOUT) };

    let protocol: u16 = tp_field(ctx, layout.tp_protocol)?;
    let reason: u32 = tp_field(ctx, layout.tp_reason)?;
    let skb: *const u8 = tp_field(ctx, layout.tp_skbaddr)?;

    let site = DropSite {
        protocol,
        reason,
        buffer: (!skb.is_null()).then_some(SkbRef { skb, layout }),
    };
    observe_drop(&site, &MonitoredIfs, &PerfSink { ctx }, || unsafe {
        bpf_ktime_get_ns()
    })?;
    Ok(reason)
}

#[inline(always)]
fn tp_field<T>(ctx: &TracePointContext, offset: u32) -> Result<T, ClassifyError> {
    unsafe { ctx.read_at::<T>(offset as usize) }.map_err(|_| ClassifyError::DeferredReadFailure)
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

/// The frame between `data` and `data_end`.
struct PacketWindow<'a> {
    ctx: &'a XdpContext,
}

impl HeaderSource for PacketWindow<'_> {
    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], ClassifyError> {
        let ptr: *const [u8; N] = ptr_at(self.ctx, offset).map_err(|_| ClassifyError::ShortBuffer)?;
        Ok(unsafe { *ptr })
    }
}

/// A `struct sk_buff` handed to the `skb/kfree_skb` tracepoint. Nothing
/// here is dereferenced directly; the buffer may be in the middle of being
/// freed.
struct SkbRef {
    skb: *const u8,
    layout: DropHookLayout,
}

impl SkbRef {
    #[inline(always)]
    fn field<T>(&self, offset: u32) -> Result<T, ClassifyError> {
        unsafe { bpf_probe_read_kernel(self.skb.add(offset as usize) as *const T) }
            .map_err(|_| ClassifyError::DeferredReadFailure)
    }
}

impl DropBuffer for SkbRef {
    type Image = RetainedImage;

    #[inline(always)]
    fn ifindex(&self) -> Result<i32, ClassifyError> {
        self.field(self.layout.skb_iif)
    }

    #[inline(always)]
    fn network_header(&self) -> Result<u16, ClassifyError> {
        self.field(self.layout.skb_network_header)
    }

    #[inline(always)]
    fn transport_header(&self) -> Result<u16, ClassifyError> {
        self.field(self.layout.skb_transport_header)
    }

    #[inline(always)]
    fn recorded_len(&self) -> Result<u32, ClassifyError> {
        self.field(self.layout.skb_len)
    }

    #[inline(always)]
    fn image(&self) -> Result<RetainedImage, ClassifyError> {
        let head: *const u8 = self.field(self.layout.skb_head)?;
        if head.is_null() {
            return Err(ClassifyError::DeferredReadFailure);
        }
        Ok(RetainedImage { head })
    }
}

/// Bytes from `skb->head`, read with `bpf_probe_read_kernel` only.
struct RetainedImage {
    head: *const u8,
}

impl HeaderSource for RetainedImage {
    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], ClassifyError> {
        unsafe { bpf_probe_read_kernel(self.head.add(offset) as *const [u8; N]) }
            .map_err(|_| ClassifyError::DeferredReadFailure)
    }
}

struct MonitoredIfs;

impl InterfaceRegistry for MonitoredIfs {
    #[inline(always)]
    fn lookup(&self, ifindex: u32) -> bool {
        unsafe { MONITORED_IFS.get(&ifindex).is_some() }
    }
}

struct PerfSink<'a, C: EbpfContext> {
    ctx: &'a C,
}

impl<C: EbpfContext> EventSink for PerfSink<'_, C> {
    #[inline(always)]
    fn emit(&self, event: &PacketEvent) {
        // A full per-CPU ring loses the record; userspace sees it as `lost`.
        let _ = unsafe { EVENTS.output(self.ctx, event, 0) };
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
