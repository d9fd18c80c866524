//! In-process platform
//!
//! The hardware view of the machine we are running on. Topology comes from
//! sysfs on Linux, with a `num_cpus` fallback elsewhere. The frequency view
//! is read-only: corral reports per-package frequencies but never programs
//! host P-states, so every programming operation is refused and validation
//! rejects frequency strategies on this platform.

use std::sync::Arc;

use sysinfo::{CpuExt, CpuRefreshKind, RefreshKind, System, SystemExt};

use crate::arch::frequency::{Frequency, FrequencyDomain, Governor};
use crate::arch::platform::{Platform, ThreadHandler};
use crate::arch::topology::{Cpu, PhysicalCore, Topology, VirtualCore, VirtualCoreId};

/// The platform of the host machine.
pub struct LocalPlatform {
    topology: Topology,
    domains: Vec<Arc<SysFrequencyView>>,
}

impl LocalPlatform {
    /// Detect the host topology and frequency view.
    pub fn detect() -> Self {
        let topology = detect_topology();
        let domains = frequency_view(&topology);
        Self { topology, domains }
    }
}

impl Platform for LocalPlatform {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn domains(&self) -> Vec<Arc<dyn FrequencyDomain>> {
        self.domains
            .iter()
            .map(|domain| domain.clone() as Arc<dyn FrequencyDomain>)
            .collect()
    }

    fn thread_handler(&self) -> Arc<dyn ThreadHandler> {
        Arc::new(LocalThreadHandler::for_current_thread())
    }

    fn hot_unplug(&self, vc: VirtualCoreId) -> bool {
        tracing::debug!(vc, "hot-unplug is not supported on the local platform");
        false
    }
}

/// Detect the host topology, preferring sysfs on Linux.
fn detect_topology() -> Topology {
    #[cfg(target_os = "linux")]
    {
        match detect_topology_linux() {
            Ok(topology) if !topology.virtual_cores().is_empty() => return topology,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("sysfs topology detection failed: {err}");
            }
        }
    }
    fallback_topology()
}

/// Single-package approximation from logical/physical counts.
fn fallback_topology() -> Topology {
    let logical = num_cpus::get().max(1);
    let physical = num_cpus::get_physical().clamp(1, logical);

    let mut cores: Vec<PhysicalCore> = (0..physical)
        .map(|id| PhysicalCore {
            id,
            cpu: 0,
            virtual_cores: Vec::new(),
        })
        .collect();

    // The OS enumerates one context per core before descending into SMT
    // siblings; mirror that numbering here.
    for vc in 0..logical {
        let core = vc % physical;
        cores[core].virtual_cores.push(VirtualCore {
            id: vc,
            physical_core: core,
            cpu: 0,
            hot_pluggable: false,
        });
    }

    Topology::new(vec![Cpu {
        id: 0,
        physical_cores: cores,
    }])
}

#[cfg(target_os = "linux")]
fn detect_topology_linux() -> Result<Topology, std::io::Error> {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    let base = Path::new("/sys/devices/system/cpu");
    let mut vcs: Vec<usize> = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("cpu") {
            if let Ok(id) = rest.parse::<usize>() {
                vcs.push(id);
            }
        }
    }
    vcs.sort_unstable();

    // Offline cpus have no topology directory; keep only the online set.
    if let Ok(online) = fs::read_to_string(base.join("online")) {
        let online = Topology::parse_cpu_list(online.trim());
        if !online.is_empty() {
            vcs.retain(|vc| online.contains(vc));
        }
    }

    // package id -> core id -> virtual core ids, in discovery order
    let mut packages: BTreeMap<usize, BTreeMap<usize, Vec<usize>>> = BTreeMap::new();
    for vc in &vcs {
        let topo = base.join(format!("cpu{vc}/topology"));
        let package: usize = fs::read_to_string(topo.join("physical_package_id"))?
            .trim()
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad package id"))?;
        let core: usize = fs::read_to_string(topo.join("core_id"))?
            .trim()
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad core id"))?;
        packages.entry(package).or_default().entry(core).or_default().push(*vc);
    }

    let mut next_physical = 0usize;
    let mut cpus = Vec::with_capacity(packages.len());
    for (package, cores) in packages {
        let mut physical_cores = Vec::with_capacity(cores.len());
        for (_core, siblings) in cores {
            let id = next_physical;
            next_physical += 1;
            let virtual_cores = siblings
                .into_iter()
                .map(|vc| VirtualCore {
                    id: vc,
                    physical_core: id,
                    cpu: package,
                    // cpu0 has no `online` knob; everything else usually does,
                    // but this façade cannot unplug either way
                    hot_pluggable: false,
                })
                .collect();
            physical_cores.push(PhysicalCore {
                id,
                cpu: package,
                virtual_cores,
            });
        }
        cpus.push(Cpu {
            id: package,
            physical_cores,
        });
    }

    Ok(Topology::new(cpus))
}

/// One read-only frequency domain per cpu package.
fn frequency_view(topology: &Topology) -> Vec<Arc<SysFrequencyView>> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new().with_frequency()),
    );
    let per_vc_mhz: Vec<u64> = system.cpus().iter().map(|cpu| cpu.frequency()).collect();

    topology
        .cpus()
        .iter()
        .map(|cpu| {
            let vcs: Vec<VirtualCoreId> = cpu
                .physical_cores
                .iter()
                .flat_map(|core| core.virtual_cores.iter().map(|vc| vc.id))
                .collect();
            let current = vcs
                .iter()
                .filter_map(|vc| per_vc_mhz.get(*vc))
                .max()
                .map(|mhz| mhz * 1_000);
            Arc::new(SysFrequencyView {
                id: cpu.id,
                vcs,
                current,
            })
        })
        .collect()
}

/// Read-only view of a package's frequency. Cannot be programmed.
struct SysFrequencyView {
    id: usize,
    vcs: Vec<VirtualCoreId>,
    current: Option<Frequency>,
}

impl FrequencyDomain for SysFrequencyView {
    fn id(&self) -> usize {
        self.id
    }

    fn virtual_cores(&self) -> Vec<VirtualCoreId> {
        self.vcs.clone()
    }

    fn current_governor(&self) -> Option<Governor> {
        None
    }

    fn current_frequency(&self) -> Option<Frequency> {
        self.current
    }

    fn available_governors(&self) -> Vec<Governor> {
        Vec::new()
    }

    fn available_frequencies(&self) -> Vec<Frequency> {
        Vec::new()
    }

    fn set_governor(&self, _governor: Governor) -> bool {
        false
    }

    fn set_governor_bounds(&self, _lower: Frequency, _upper: Frequency) -> bool {
        false
    }

    fn set_userspace_frequency(&self, _frequency: Frequency) -> bool {
        false
    }

    fn set_highest_userspace(&self) -> bool {
        false
    }

    fn set_lowest_userspace(&self) -> bool {
        false
    }
}

/// Affinity handle for a host thread.
struct LocalThreadHandler {
    thread_id: std::thread::ThreadId,
    #[cfg(target_os = "linux")]
    tid: libc::pid_t,
}

impl LocalThreadHandler {
    fn for_current_thread() -> Self {
        Self {
            thread_id: std::thread::current().id(),
            #[cfg(target_os = "linux")]
            tid: unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t },
        }
    }
}

impl ThreadHandler for LocalThreadHandler {
    fn move_to(&self, vc: VirtualCoreId) -> bool {
        // The handled thread can always pin itself through core_affinity.
        if std::thread::current().id() == self.thread_id {
            if let Some(cores) = core_affinity::get_core_ids() {
                if let Some(core) = cores.into_iter().find(|core| core.id == vc) {
                    return core_affinity::set_for_current(core);
                }
            }
        }

        #[cfg(target_os = "linux")]
        {
            return set_affinity(self.tid, vc);
        }

        #[cfg(not(target_os = "linux"))]
        {
            tracing::warn!(vc, "cross-thread affinity moves need Linux");
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(tid: libc::pid_t, vc: VirtualCoreId) -> bool {
    if vc >= libc::CPU_SETSIZE as usize {
        return false;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(vc, &mut set);
        libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_topology() {
        let platform = LocalPlatform::detect();
        let topology = platform.topology();
        println!("Detected topology: {:?}", topology);
        assert!(!topology.virtual_cores().is_empty());
        assert_eq!(platform.domains().len(), topology.cpus().len());
    }

    #[test]
    fn test_local_domains_are_read_only() {
        let platform = LocalPlatform::detect();
        for domain in platform.domains() {
            assert!(domain.available_governors().is_empty());
            assert!(!domain.set_governor(Governor::Performance));
        }
    }

    #[test]
    fn test_fallback_topology_covers_all_logical_cores() {
        let topology = fallback_topology();
        assert_eq!(topology.virtual_cores().len(), num_cpus::get().max(1));
        assert_eq!(topology.cpus().len(), 1);
    }

    #[test]
    fn test_handler_can_move_own_thread() {
        let platform = LocalPlatform::detect();
        let handler = platform.thread_handler();
        // Pinning may be refused in restricted environments; only assert
        // that the call does not panic.
        let _ = handler.move_to(0);
    }
}
