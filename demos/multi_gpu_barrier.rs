//! Repeatedly build a barrier across all ranks and run it while unrelated
//! allocations churn device memory on the side.
//!
//! With `HSA_REPRO_RENDEZVOUS` set, this process is one rank (`LOCAL_RANK` of
//! `LOCAL_WORLD_SIZE`) and handles are exchanged through that directory. Without
//! it, every rank runs as a thread of this process.
//!
//! A rank that fails leaves its peers blocked in `run()`; the hang is the signal.

use hsa_repro::{
    AllGather, DeviceIndex, FileAllGather, HarnessConfig, MemoryDriver, MultiGpuBarrier,
    ReproResult, StressLoop, ThreadAllGather, VirtualMemoryManager, VirtualReservation,
    open_driver,
};
use rand::Rng;
use std::slice;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const RUNS_PER_ROUND: u64 = 1000;
const PRESSURE_MAX: usize = 40 << 20;
const PRESSURE_RESERVATION: usize = 64 << 20;

/// Commits a random-sized buffer, touches every element and frees it.
fn churn(
    vmm: &mut VirtualMemoryManager,
    reservation: &VirtualReservation,
    device: DeviceIndex,
    rng: &mut impl Rng,
) -> ReproResult<()> {
    let size = rng.gen_range(0..=PRESSURE_MAX);
    if size == 0 {
        return Ok(());
    }
    let buffer = vmm.allocate(device, reservation, size, None)?;
    let values =
        unsafe { slice::from_raw_parts_mut(buffer.as_ptr().cast::<f32>(), buffer.size / 4) };
    let seed: f32 = rng.r#gen();
    for v in values.iter_mut() {
        *v = seed;
    }
    for v in values.iter_mut() {
        *v += *v;
    }
    vmm.deallocate(&buffer)
}

fn run_rank(
    driver: &Arc<dyn MemoryDriver>,
    device: DeviceIndex,
    rank: usize,
    world_size: usize,
    stress: &StressLoop,
    group_for_round: impl Fn(u64) -> Box<dyn AllGather>,
) -> ReproResult<()> {
    let mut rng = rand::thread_rng();
    let mut pressure = VirtualMemoryManager::new(Arc::clone(driver));
    let scratch = pressure.reserve(device, PRESSURE_RESERVATION)?;

    stress.run(|round| {
        if rank == 0 {
            println!("Running iter # {round}");
        }
        let mut barrier = MultiGpuBarrier::create(Arc::clone(driver), device, rank, world_size)?;
        barrier.connect(group_for_round(round).as_ref())?;

        for _ in 0..RUNS_PER_ROUND {
            churn(&mut pressure, &scratch, device, &mut rng)?;
            barrier.run()?;
        }
        tracing::debug!(rank, round, generation = barrier.generation(), "round complete");
        Ok(())
    })?;

    pressure.release(&scratch)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HarnessConfig::from_env()?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .with_target(false)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let driver = open_driver(&config)?;
    let stress = StressLoop {
        max_iterations: config.iterations,
        ..StressLoop::default()
    };

    if let Some(dir) = config.rendezvous.clone() {
        // One process per rank; a fresh directory per round.
        run_rank(
            &driver,
            config.device(),
            config.rank,
            config.world_size,
            &stress,
            |round| Box::new(FileAllGather::new(dir.join(format!("round-{round}")))),
        )?;
        return Ok(());
    }

    let world_size = config.world_size;
    if driver.device_count() < world_size as u32 {
        return Err(format!(
            "{world_size} ranks need {world_size} devices, {} found",
            driver.device_count()
        )
        .into());
    }

    let group = Arc::new(ThreadAllGather::new(world_size));
    let workers: Vec<_> = (0..world_size)
        .map(|rank| {
            let driver = Arc::clone(&driver);
            let group = Arc::clone(&group);
            let stress = stress.clone();
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    run_rank(&driver, rank as DeviceIndex, rank, world_size, &stress, |_| {
                        Box::new(Arc::clone(&group))
                    })
                })
        })
        .collect::<Result<_, _>>()?;

    for (rank, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => return Err(format!("rank {rank} panicked").into()),
        }
    }
    Ok(())
}

