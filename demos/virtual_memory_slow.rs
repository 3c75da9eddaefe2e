//! Time the reservation of 2^38 bytes of address space against 2^24 bytes.
//! A healthy driver reserves both in about the same time.

use hsa_repro::{HarnessConfig, VirtualMemoryManager, open_driver, measure_reserve_scaling};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SMALL_SIZE: usize = 1 << 24;
const VIRTUAL_SIZE: usize = 1 << 38;
const MAX_FACTOR: f64 = 10.0;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HarnessConfig::from_env()?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = config.device();
    let mut vmm = VirtualMemoryManager::new(open_driver(&config)?);

    let scaling = measure_reserve_scaling(&mut vmm, device, SMALL_SIZE, VIRTUAL_SIZE, MAX_FACTOR)?;
    println!("Reserve 2^24: {:?}", scaling.small);
    println!("Reserve 2^38: {:?}", scaling.large);
    println!("Ratio {:.1}x (bound {MAX_FACTOR}x)", scaling.ratio);

    if !scaling.within_bound {
        return Err(format!(
            "reserve latency grew {:.1}x with size, above the {MAX_FACTOR}x bound",
            scaling.ratio
        )
        .into());
    }
    Ok(())
}
