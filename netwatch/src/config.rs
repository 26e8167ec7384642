use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf};

use aya::programs::XdpFlags;
use clap::{Parser, ValueEnum};
use netwatch_common::DropHookLayout;
use tracing::warn;

use crate::tracefs::TraceFormat;

/// Observe IPv4 ingress traffic and kernel packet drops
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the eBPF object
    #[arg(short, long)]
    pub path: PathBuf,

    /// Interface to attach the ingress classifier to; repeat for more
    #[arg(short, long = "iface", default_value = "eth0")]
    pub ifaces: Vec<String>,

    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = XdpMode::Auto)]
    pub xdp_mode: XdpMode,

    /// Address the Prometheus endpoint listens on
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// Do not serve metrics
    #[arg(long)]
    pub no_metrics: bool,

    /// Events buffered between the perf readers and the monitor
    #[arg(long, default_value = "4096")]
    pub channel_capacity: NonZeroUsize,

    /// Print every event as a JSON line on stdout
    #[arg(long)]
    pub json: bool,

    /// Override sk_buff field offsets, e.g. `len=112,iif=148,head=200`
    #[arg(long, value_parser = parse_skb_offsets)]
    pub skb_offsets: Option<SkbOffsets>,

    /// Tracefs mount point
    #[arg(long, default_value = "/sys/kernel/tracing")]
    pub tracefs: PathBuf,

    /// Kernel BTF used to place sk_buff members
    #[arg(long, default_value = "/sys/kernel/btf/vmlinux")]
    pub btf: PathBuf,
}

const KERNEL_DEFAULT: XdpFlags = XdpFlags::empty();

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum XdpMode {
    /// Native driver mode, falling back to generic mode and then kernel default
    Auto,
    Drv,
    Skb,
    Default,
}

impl XdpMode {
    /// Flags to try, in order.
    pub fn attempts(self) -> &'static [XdpFlags] {
        match self {
            XdpMode::Auto => &[XdpFlags::DRV_MODE, XdpFlags::SKB_MODE, KERNEL_DEFAULT],
            XdpMode::Drv => &[XdpFlags::DRV_MODE],
            XdpMode::Skb => &[XdpFlags::SKB_MODE],
            XdpMode::Default => &[KERNEL_DEFAULT],
        }
    }
}

/// `sk_buff` offsets from the kernel's BTF or the command line. Unset
/// members keep whatever the layout already holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkbOffsets {
    pub len: Option<u32>,
    pub iif: Option<u32>,
    pub head: Option<u32>,
    pub network: Option<u32>,
    pub transport: Option<u32>,
}

impl SkbOffsets {
    pub fn unresolved(&self) -> Vec<&'static str> {
        [
            ("len", self.len),
            ("skb_iif", self.iif),
            ("head", self.head),
            ("network_header", self.network),
            ("transport_header", self.transport),
        ]
        .into_iter()
        .filter_map(|(name, offset)| offset.is_none().then_some(name))
        .collect()
    }

    pub fn apply(&self, layout: &mut DropHookLayout) {
        if let Some(v) = self.len {
            layout.skb_len = v;
        }
        if let Some(v) = self.iif {
            layout.skb_iif = v;
        }
        if let Some(v) = self.head {
            layout.skb_head = v;
        }
        if let Some(v) = self.network {
            layout.skb_network_header = v;
        }
        if let Some(v) = self.transport {
            layout.skb_transport_header = v;
        }
    }
}

pub fn parse_skb_offsets(s: &str) -> Result<SkbOffsets, String> {
    let mut offsets = SkbOffsets::default();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=offset, got `{pair}`"))?;
        let value: u32 = value
            .trim()
            .parse()
            .map_err(|_| format!("`{}` is not an offset", value.trim()))?;
        let slot = match key.trim() {
            "len" => &mut offsets.len,
            "iif" => &mut offsets.iif,
            "head" => &mut offsets.head,
            "network" => &mut offsets.network,
            "transport" => &mut offsets.transport,
            other => return Err(format!("unknown sk_buff field `{other}`")),
        };
        *slot = Some(value);
    }
    Ok(offsets)
}

/// Defaults, then the tracepoint format, then the kernel's BTF, then
/// command-line overrides.
pub fn resolve_layout(
    format: Option<&TraceFormat>,
    kernel: Option<&SkbOffsets>,
    overrides: Option<&SkbOffsets>,
) -> DropHookLayout {
    let mut layout = DropHookLayout::DEFAULT;
    if let Some(format) = format {
        for field in format.apply(&mut layout) {
            warn!(field, "kfree_skb format lacks field, keeping default offset");
        }
    }
    if let Some(kernel) = kernel {
        for member in kernel.unresolved() {
            warn!(member, "sk_buff member not found in BTF, keeping default offset");
        }
        kernel.apply(&mut layout);
    }
    if let Some(overrides) = overrides {
        overrides.apply(&mut layout);
    }
    layout
}
