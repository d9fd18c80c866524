use corral_core::arch::{FrequencyDomain, LocalPlatform, Platform};

fn main() {
    let platform = LocalPlatform::detect();
    let topology = platform.topology();

    println!("Detected {} cpu package(s)", topology.cpus().len());
    println!("Detected {} physical cores", topology.physical_cores_count());
    println!("Detected {} virtual cores", topology.virtual_cores().len());
    println!(
        "Hardware contexts per physical core: {}",
        topology.hw_contexts_per_physical_core()
    );

    for cpu in topology.cpus() {
        println!("\nCpu {}:", cpu.id);
        for core in &cpu.physical_cores {
            let siblings: Vec<usize> = core.virtual_cores.iter().map(|vc| vc.id).collect();
            println!("  physical core {} -> virtual cores {:?}", core.id, siblings);
        }
    }

    println!("\nFrequency view:");
    for domain in platform.domains() {
        match domain.current_frequency() {
            Some(khz) => println!(
                "  domain {} ({} virtual cores): {} MHz",
                domain.id(),
                domain.virtual_cores().len(),
                khz / 1_000
            ),
            None => println!(
                "  domain {} ({} virtual cores): frequency unknown",
                domain.id(),
                domain.virtual_cores().len()
            ),
        }
    }

    println!("\nLinear mapping order:");
    let order: Vec<usize> = topology.linear_candidates().iter().map(|vc| vc.id).collect();
    println!("  {:?}", order);
}
