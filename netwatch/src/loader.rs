use std::path::Path;

use aya::{
    maps::{perf::AsyncPerfEventArray, HashMap, MapData},
    programs::{ProgramError, TracePoint, Xdp, XdpFlags},
    Ebpf, EbpfLoader,
};
use netwatch_common::DropHookLayout;
use tracing::{debug, info, warn};

use crate::{
    config::XdpMode,
    error::{Error, Result},
    registry::MonitoredInterfaces,
};

pub const INGRESS_PROGRAM: &str = "netwatch_ingress";
pub const DROP_PROGRAM: &str = "netwatch_drop";
pub const EVENTS_MAP: &str = "EVENTS";
pub const REGISTRY_MAP: &str = "MONITORED_IFS";
const LAYOUT_GLOBAL: &str = "DROP_HOOK_LAYOUT";

/// Loads the object at `path` with `layout` patched into the drop observer.
pub fn load(path: &Path, layout: &DropHookLayout) -> Result<Ebpf> {
    let ebpf = EbpfLoader::new()
        .set_global(LAYOUT_GLOBAL, layout, true)
        .load_file(path)?;
    debug!(path = %path.display(), ?layout, "loaded eBPF object");
    Ok(ebpf)
}

/// Forwards `aya-log` records from the kernel programs. The logger runs its
/// own reader; a missing log map only means the object logs nothing.
pub fn init_kernel_logger(ebpf: &mut Ebpf) {
    if let Err(e) = aya_log::EbpfLogger::init(ebpf) {
        warn!("failed to initialize eBPF logger: {}", e);
    }
}

pub fn attach_drop(ebpf: &mut Ebpf) -> Result<()> {
    let program: &mut TracePoint = ebpf
        .program_mut(DROP_PROGRAM)
        .ok_or(Error::Missing(DROP_PROGRAM))?
        .try_into()?;
    program.load()?;
    program.attach("skb", "kfree_skb")?;
    info!("attached {} to skb/kfree_skb", DROP_PROGRAM);
    Ok(())
}

fn ingress(ebpf: &mut Ebpf) -> Result<&mut Xdp> {
    Ok(ebpf
        .program_mut(INGRESS_PROGRAM)
        .ok_or(Error::Missing(INGRESS_PROGRAM))?
        .try_into()?)
}

pub fn load_ingress(ebpf: &mut Ebpf) -> Result<()> {
    ingress(ebpf)?.load()?;
    Ok(())
}

/// Attaches the loaded ingress classifier to `iface`, walking the flags of
/// `mode` until one is accepted. Returns the flags that worked.
pub fn attach_ingress(ebpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpFlags> {
    let program = ingress(ebpf)?;
    let mut last = None;
    for &flags in mode.attempts() {
        match program.attach(iface, flags) {
            Ok(_) => {
                info!(iface, ?flags, "attached {}", INGRESS_PROGRAM);
                return Ok(flags);
            }
            Err(e) => {
                warn!(iface, ?flags, "XDP attach failed: {}", e);
                last = Some(e);
            }
        }
    }
    Err(last
        .unwrap_or(ProgramError::UnexpectedProgramType)
        .into())
}

pub fn take_registry(ebpf: &mut Ebpf) -> Result<MonitoredInterfaces<HashMap<MapData, u32, u32>>> {
    let map = ebpf.take_map(REGISTRY_MAP).ok_or(Error::Missing(REGISTRY_MAP))?;
    Ok(MonitoredInterfaces::new(HashMap::try_from(map)?))
}

pub fn take_events(ebpf: &mut Ebpf) -> Result<AsyncPerfEventArray<MapData>> {
    let map = ebpf.take_map(EVENTS_MAP).ok_or(Error::Missing(EVENTS_MAP))?;
    Ok(AsyncPerfEventArray::try_from(map)?)
}
