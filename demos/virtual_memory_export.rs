//! Export a 1 MiB allocation and import it again into the same manager. Writes
//! through one mapping must be visible through the other.

use hsa_repro::{ExportedHandle, HarnessConfig, VirtualMemoryManager, open_driver};
use std::ptr;
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

    let reservation = vmm.reserve(device, VIRTUAL_SIZE)?;
    let original = vmm.allocate(device, &reservation, ALLOC_SIZE, None)?;

    let handle = vmm.export(&original)?;
    // Go through the wire form, as a peer process would.
    let handle = ExportedHandle::from_bytes(&handle.to_bytes())?;
    println!("Exported {handle:?}");

    let imported = vmm.import(&handle, device, &reservation, None)?;
    println!(
        "Imported at 0x{:x} (original at 0x{:x})",
        imported.va, original.va
    );

    let pattern: Vec<u8> = (0..ALLOC_SIZE).map(|i| (i % 251) as u8).collect();
    let mut readback = vec![0u8; ALLOC_SIZE];
    unsafe {
        ptr::copy_nonoverlapping(pattern.as_ptr(), original.as_ptr(), ALLOC_SIZE);
        ptr::copy_nonoverlapping(imported.as_ptr(), readback.as_mut_ptr(), ALLOC_SIZE);
    }
    let matches = readback == pattern;
    println!("Read-after-write through import: {}", if matches { "ok" } else { "MISMATCH" });

    vmm.deallocate(&imported)?;
    vmm.deallocate(&original)?;
    vmm.release(&reservation)?;

    if !matches {
        return Err("imported mapping does not see the exporter's writes".into());
    }
    Ok(())
}
