//! Reserve, commit and release 1 MiB inside a 16 MiB reservation, printing the
//! device's free memory after each step. Deallocation must return exactly what
//! allocation took.

use hsa_repro::{HarnessConfig, StressLoop, VirtualMemoryManager, open_driver};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const VIRTUAL_SIZE: usize = 1 << 24;
const ALLOC_SIZE: usize = 1 << 20;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HarnessConfig::from_env()?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = config.device();
    let mut vmm = VirtualMemoryManager::new(open_driver(&config)?);

    let free_1 = vmm.memory_info(device)?.free;
    let reservation = vmm.reserve(device, VIRTUAL_SIZE)?;
    let free_2 = vmm.memory_info(device)?.free;
    println!("Reserved mem    {}", i128::from(free_1) - i128::from(free_2));

    let free_1 = vmm.memory_info(device)?.free;
    let allocation = vmm.allocate(device, &reservation, ALLOC_SIZE, None)?;
    let free_2 = vmm.memory_info(device)?.free;
    println!("Allocated mem   {}", i128::from(free_1) - i128::from(free_2));

    let free_1 = vmm.memory_info(device)?.free;
    vmm.deallocate(&allocation)?;
    let free_2 = vmm.memory_info(device)?.free;
    println!("Deallocated mem {}", i128::from(free_2) - i128::from(free_1));

    // Repeat to surface slow leaks.
    let baseline = vmm.memory_info(device)?.free;
    let iterations = config.iterations.unwrap_or(1000);
    let summary = StressLoop::bounded(iterations).run(|_| {
        let a = vmm.allocate(device, &reservation, ALLOC_SIZE, None)?;
        vmm.deallocate(&a)
    })?;
    let leaked = i128::from(baseline) - i128::from(vmm.memory_info(device)?.free);
    println!(
        "{} allocate/deallocate cycles in {:?}, leaked {leaked} bytes",
        summary.iterations, summary.elapsed
    );

    vmm.release(&reservation)?;
    if leaked != 0 {
        return Err(format!("{leaked} bytes leaked").into());
    }
    Ok(())
}
