use std::fs;

use crate::error::{Error, Result};

const CAP_NET_ADMIN: u32 = 12;
const CAP_SYS_ADMIN: u32 = 21;
const CAP_BPF: u32 = 39;

/// Fails unless the process can load and attach the programs: root, or
/// `CAP_BPF` (`CAP_SYS_ADMIN` before 5.8) together with `CAP_NET_ADMIN`.
pub fn check_permissions() -> Result<()> {
    let status = fs::read_to_string("/proc/self/status")?;
    let euid = unsafe { libc::geteuid() };
    let missing = missing_capabilities(&status, euid);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Permission(missing.join(", ")))
    }
}

fn missing_capabilities(status: &str, euid: u32) -> Vec<&'static str> {
    if euid == 0 {
        return Vec::new();
    }
    let effective = status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .unwrap_or(0);
    let has = |cap: u32| effective & (1u64 << cap) != 0;

    let mut missing = Vec::new();
    if !has(CAP_BPF) && !has(CAP_SYS_ADMIN) {
        missing.push("CAP_BPF");
    }
    if !has(CAP_NET_ADMIN) {
        missing.push("CAP_NET_ADMIN");
    }
    missing
}

/// Lifts the locked-memory limit. Kernels before 5.11 charge map memory to
/// it instead of the memory cgroup.
pub fn remove_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
