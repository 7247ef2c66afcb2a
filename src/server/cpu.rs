//! Container-aware CPU limit detection for sizing the tokio worker pool.
//!
//! Order: explicit `PROXY_ENGINE_CPU_LIMIT` env var ("4" or "4000m"),
//! cgroup v2 `cpu.max`, then the host CPU count. Without this, tokio
//! defaults to the host count, over-provisioning threads in containers
//! limited to a fraction of the machine.

pub fn worker_threads() -> usize {
    if let Ok(value) = std::env::var("PROXY_ENGINE_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            return cores.max(1);
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&max) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period" (unlimited).
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
