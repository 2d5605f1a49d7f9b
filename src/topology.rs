// FLOWLINE — CPU / NUMA TOPOLOGY
// Discovery reads /sys like every other data-plane tool; pinning goes
// through sched_setaffinity. Absence of the sysfs tree (containers, tests)
// degrades to a single node and best-effort pinning, never a failure.

use tracing::warn;

pub fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Number of configured NUMA nodes, from /sys/devices/system/node.
pub fn num_nodes() -> usize {
    let mut count = 0;
    if let Ok(dir) = std::fs::read_dir("/sys/devices/system/node") {
        for entry in dir.flatten() {
            let name = entry.file_name();
            if let Some(s) = name.to_str() {
                if s.starts_with("node") && s[4..].chars().all(|c| c.is_ascii_digit()) {
                    count += 1;
                }
            }
        }
    }
    count.max(1)
}

/// NUMA node of a CPU: the nodeN entry under its sysfs directory.
pub fn node_of_cpu(cpu: usize) -> usize {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}");
    if let Ok(dir) = std::fs::read_dir(&path) {
        for entry in dir.flatten() {
            let name = entry.file_name();
            if let Some(s) = name.to_str() {
                if let Some(n) = s.strip_prefix("node") {
                    if let Ok(node) = n.parse() {
                        return node;
                    }
                }
            }
        }
    }
    0
}

/// Pin the calling thread to one core. Best-effort: a refusal (cgroup
/// restriction, test sandbox) is logged and the thread runs unpinned.
pub fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % online_cpus(), &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(core, "sched_setaffinity failed, running unpinned");
        }
    }
}

/// True when the calling thread's affinity mask is exactly `core`.
pub fn verify_affinity(core: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return false;
        }
        let want = core % online_cpus();
        if !libc::CPU_ISSET(want, &set) {
            return false;
        }
        let mut others = 0;
        for cpu in 0..online_cpus() {
            if cpu != want && libc::CPU_ISSET(cpu, &set) {
                others += 1;
            }
        }
        others == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_reports_sane_values() {
        assert!(online_cpus() >= 1);
        assert!(num_nodes() >= 1);
        assert!(node_of_cpu(0) < num_nodes().max(1) + 8);
    }
}
