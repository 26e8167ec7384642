use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{future::ready, net::SocketAddr};
use tokio::{net::TcpListener, signal, task};
use tracing::{debug, error, info, warn};

mod btf;
mod channel;
mod clock;
mod config;
mod error;
mod events;
mod loader;
mod monitor;
mod reasons;
mod registry;
mod system;
mod tracefs;

use channel::EventChannel;
use clock::WallClock;
use config::Args;
use monitor::Monitor;
use reasons::DropReasons;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "netwatch=info".into()))
        .init();

    let args = Args::parse();

    system::check_permissions().context("cannot load eBPF programs")?;
    if let Err(e) = system::remove_memlock_rlimit() {
        debug!("failed to remove memlock rlimit: {}", e);
    }

    if !args.no_metrics {
        info!("Starting metrics server on {}", args.metrics_addr);
        setup_metrics_server(args.metrics_addr).await?;
    }

    let format = match tracefs::read(&args.tracefs) {
        Ok(format) => Some(format),
        Err(e) => {
            warn!("kfree_skb format unavailable, using built-in offsets: {}", e);
            None
        }
    };
    let kernel_btf = match btf::read(&args.btf) {
        Ok(btf) => Some(btf),
        Err(e) => {
            warn!("kernel BTF unavailable, sk_buff offsets may not match this kernel: {}", e);
            None
        }
    };
    let kernel_skb = kernel_btf.as_ref().map(btf::Btf::skb_offsets);
    let layout = config::resolve_layout(format.as_ref(), kernel_skb.as_ref(), args.skb_offsets.as_ref());
    let reasons = kernel_btf
        .as_ref()
        .and_then(btf::Btf::drop_reasons)
        .or_else(|| format.map(|format| format.reasons))
        .filter(|reasons| !reasons.is_empty())
        .unwrap_or_else(DropReasons::builtin);
    info!(count = reasons.len(), "drop reason names loaded");
    let clock = WallClock::new().context("failed to read the system clocks")?;

    let mut ebpf = loader::load(&args.path, &layout)
        .with_context(|| format!("failed to load {}", args.path.display()))?;
    loader::init_kernel_logger(&mut ebpf);

    let mut monitored = loader::take_registry(&mut ebpf)?;
    let mut perf = loader::take_events(&mut ebpf)?;

    loader::load_ingress(&mut ebpf)?;
    for iface in &args.ifaces {
        let ifindex = registry::ifindex_of(iface)?;
        loader::attach_ingress(&mut ebpf, iface, args.xdp_mode)
            .with_context(|| format!("failed to attach the XDP program to {iface}, try --xdp-mode skb"))?;
        monitored.register(ifindex)?;
    }
    info!(interfaces = monitored.len(), "monitoring ingress");
    loader::attach_drop(&mut ebpf).context("failed to attach the kfree_skb tracepoint")?;

    let (channel, rx) = EventChannel::bounded(args.channel_capacity.get());
    let channel_dropped = channel.dropped_counter();

    info!("starting event loops");
    let readers = events::spawn_readers(&mut perf, channel)?;

    let mut monitor = Monitor::new(rx, reasons, clock);
    if args.json {
        monitor = monitor.with_json(Box::new(std::io::stdout()));
    }
    let monitor = task::spawn(monitor.run());

    info!("waiting for ctrl-c");
    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    for reader in &readers {
        reader.abort();
    }
    for reader in readers {
        let _ = reader.await;
    }
    let stats = monitor.await?;

    for (ifindex, e) in monitored.clear() {
        warn!(ifindex, "failed to unregister interface: {}", e);
    }
    if !monitored.is_empty() {
        warn!(remaining = monitored.len(), "interfaces left in MONITORED_IFS");
    }
    info!(
        passed = stats.passed,
        dropped = stats.dropped,
        channel_dropped = channel_dropped.load(std::sync::atomic::Ordering::Relaxed),
        "exiting"
    );
    for (category, count) in &stats.by_category {
        info!("{} drops: {}", category.as_str(), count);
    }
    for (reason, count) in &stats.by_reason {
        info!("{}: {}", reason, count);
    }
    Ok::<_, anyhow::Error>(())
}

async fn setup_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install the Prometheus recorder")?;
    describe_counter!("netwatch_events_total", "Events received, by action");
    describe_counter!("netwatch_drops_total", "Observed drops, by kernel drop reason and category");
    describe_counter!("netwatch_perf_lost_total", "Records the kernel could not write to the perf buffer");
    describe_counter!("netwatch_channel_dropped_total", "Events discarded because the monitor fell behind");
    describe_counter!("netwatch_decode_errors_total", "Perf records that did not decode");

    let app = Router::new().route("/metrics", get(move || ready(recorder.render())));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;
    task::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("metrics server failed: {}", e);
        }
    });
    Ok(())
}
