use hsa_repro::{
    ExportedHandle, HostDriver, MemoryDriver, ReproError, VirtualMemoryManager,
};
use std::ptr;
use std::sync::Arc;

const MIB: usize = 1 << 20;

fn host(devices: u32, capacity: usize) -> Arc<dyn MemoryDriver> {
    Arc::new(HostDriver::new(devices, capacity as u64))
}

#[test]
fn allocate_deallocate_cycles_do_not_leak() {
    let mut vmm = VirtualMemoryManager::new(host(1, 64 * MIB));
    let reservation = vmm.reserve(0, 16 * MIB).unwrap();
    let before = vmm.memory_info(0).unwrap().free;

    for _ in 0..1000 {
        let a = vmm.allocate(0, &reservation, MIB, None).unwrap();
        assert_eq!(vmm.memory_info(0).unwrap().free, before - MIB as u64);
        vmm.deallocate(&a).unwrap();
    }

    assert_eq!(vmm.memory_info(0).unwrap().free, before);
    assert!(vmm.committed_ranges(&reservation).unwrap().is_empty());
    vmm.release(&reservation).unwrap();
}

#[test]
fn reservation_alone_takes_no_physical_memory() {
    let mut vmm = VirtualMemoryManager::new(host(1, 8 * MIB));
    let before = vmm.memory_info(0).unwrap().free;
    let reservation = vmm.reserve(0, 1 << 34).unwrap();
    assert_eq!(vmm.memory_info(0).unwrap().free, before);
    assert!(reservation.size >= 1 << 34);
    assert_eq!(reservation.base % vmm.granularity(0).unwrap().recommended as u64, 0);
    vmm.release(&reservation).unwrap();
}

#[test]
fn reserve_rounds_to_recommended_granularity() {
    let mut vmm = VirtualMemoryManager::new(host(1, 8 * MIB));
    let g = vmm.granularity(0).unwrap();
    let reservation = vmm.reserve(0, g.recommended + 1).unwrap();
    assert_eq!(reservation.size, 2 * g.recommended);
}

#[test]
fn reserve_rejects_bad_requests() {
    let mut vmm = VirtualMemoryManager::new(host(1, 8 * MIB));
    assert!(matches!(vmm.reserve(1, MIB), Err(ReproError::Reservation(_))));
    assert!(matches!(vmm.reserve(0, 0), Err(ReproError::Reservation(_))));
    assert!(matches!(vmm.reserve(0, usize::MAX), Err(ReproError::Reservation(_))));
}

#[test]
fn double_deallocate_is_invalid_handle() {
    let mut vmm = VirtualMemoryManager::new(host(1, 8 * MIB));
    let reservation = vmm.reserve(0, 4 * MIB).unwrap();
    let a = vmm.allocate(0, &reservation, MIB, None).unwrap();
    let copy = a;

    vmm.deallocate(&a).unwrap();
    assert!(matches!(vmm.deallocate(&copy), Err(ReproError::InvalidHandle(_))));
    assert!(matches!(vmm.export(&copy), Err(ReproError::InvalidHandle(_))));

    // The range is reusable and the manager still works.
    let b = vmm.allocate(0, &reservation, MIB, Some(a.offset)).unwrap();
    vmm.deallocate(&b).unwrap();
}

#[test]
fn sub_range_conflicts_are_range_errors() {
    let mut vmm = VirtualMemoryManager::new(host(1, 64 * MIB));
    let reservation = vmm.reserve(0, 4 * MIB).unwrap();

    let a = vmm.allocate(0, &reservation, 2 * MIB, Some(0)).unwrap();
    assert!(matches!(
        vmm.allocate(0, &reservation, MIB, Some(MIB)),
        Err(ReproError::Range(_))
    ));
    assert!(matches!(
        vmm.allocate(0, &reservation, 4 * MIB, Some(2 * MIB)),
        Err(ReproError::Range(_))
    ));
    assert!(matches!(
        vmm.allocate(0, &reservation, 0, None),
        Err(ReproError::Range(_))
    ));

    let b = vmm.allocate(0, &reservation, 2 * MIB, None).unwrap();
    assert_eq!(b.offset, 2 * MIB);
    assert!(matches!(
        vmm.allocate(0, &reservation, MIB, None),
        Err(ReproError::Range(_))
    ));
    assert_eq!(
        vmm.committed_ranges(&reservation).unwrap(),
        vec![(0, 2 * MIB), (2 * MIB, 2 * MIB)]
    );

    vmm.deallocate(&a).unwrap();
    vmm.deallocate(&b).unwrap();
}

#[test]
fn out_of_memory_leaves_reservation_usable() {
    let mut vmm = VirtualMemoryManager::new(host(1, 2 * MIB));
    let reservation = vmm.reserve(0, 16 * MIB).unwrap();

    let a = vmm.allocate(0, &reservation, 2 * MIB, None).unwrap();
    let err = vmm.allocate(0, &reservation, MIB, None).unwrap_err();
    assert!(matches!(err, ReproError::OutOfMemory { device: 0, .. }));
    assert_eq!(vmm.committed_ranges(&reservation).unwrap(), vec![(0, 2 * MIB)]);

    vmm.deallocate(&a).unwrap();
    let b = vmm.allocate(0, &reservation, MIB, None).unwrap();
    vmm.deallocate(&b).unwrap();
}

#[test]
fn allocation_must_match_reservation_device() {
    let mut vmm = VirtualMemoryManager::new(host(2, 8 * MIB));
    let on_zero = vmm.reserve(0, 4 * MIB).unwrap();
    assert!(matches!(
        vmm.allocate(1, &on_zero, MIB, None),
        Err(ReproError::InvalidHandle(_))
    ));
}

#[test]
fn release_requires_empty_reservation() {
    let mut vmm = VirtualMemoryManager::new(host(1, 8 * MIB));
    let reservation = vmm.reserve(0, 4 * MIB).unwrap();
    let a = vmm.allocate(0, &reservation, MIB, None).unwrap();

    assert!(matches!(vmm.release(&reservation), Err(ReproError::Reservation(_))));
    vmm.deallocate(&a).unwrap();
    vmm.release(&reservation).unwrap();
    assert!(matches!(vmm.release(&reservation), Err(ReproError::InvalidHandle(_))));
    assert!(matches!(
        vmm.allocate(0, &reservation, MIB, None),
        Err(ReproError::InvalidHandle(_))
    ));
}

#[test]
fn import_reads_what_export_wrote() {
    let mut vmm = VirtualMemoryManager::new(host(1, 16 * MIB));
    let reservation = vmm.reserve(0, 16 * MIB).unwrap();
    let original = vmm.allocate(0, &reservation, MIB, None).unwrap();

    let wire = vmm.export(&original).unwrap().to_bytes();
    let handle = ExportedHandle::from_bytes(&wire).unwrap();
    let imported = vmm.import(&handle, 0, &reservation, None).unwrap();
    assert!(imported.imported);
    assert_ne!(imported.va, original.va);
    assert_eq!(imported.size, original.size);

    let pattern: Vec<u8> = (0..MIB).map(|i| (i * 7 % 256) as u8).collect();
    let mut readback = vec![0u8; MIB];
    unsafe {
        ptr::copy_nonoverlapping(pattern.as_ptr(), original.as_ptr(), MIB);
        ptr::copy_nonoverlapping(imported.as_ptr(), readback.as_mut_ptr(), MIB);
    }
    assert_eq!(readback, pattern);

    // And the other direction.
    unsafe { imported.as_ptr().write(0xEE) };
    assert_eq!(unsafe { original.as_ptr().read() }, 0xEE);

    vmm.deallocate(&imported).unwrap();
    vmm.deallocate(&original).unwrap();
}

#[test]
fn shared_backing_is_freed_only_by_last_reference() {
    let driver = host(2, 16 * MIB);
    let mut exporter = VirtualMemoryManager::new(Arc::clone(&driver));
    let mut importer = VirtualMemoryManager::new(Arc::clone(&driver));

    let r0 = exporter.reserve(0, 4 * MIB).unwrap();
    let r1 = importer.reserve(1, 4 * MIB).unwrap();
    let free0 = driver.memory_info(0).unwrap().free;

    let original = exporter.allocate(0, &r0, MIB, None).unwrap();
    unsafe { original.as_ptr().write(42) };
    let handle = exporter.export(&original).unwrap();
    let view = importer.import(&handle, 1, &r1, None).unwrap();

    // Importing charges nothing to the importing device.
    assert_eq!(driver.memory_info(1).unwrap().free, 16 * MIB as u64);

    exporter.deallocate(&original).unwrap();
    assert_eq!(driver.memory_info(0).unwrap().free, free0 - MIB as u64);
    assert_eq!(unsafe { view.as_ptr().read() }, 42);

    importer.deallocate(&view).unwrap();
    assert_eq!(driver.memory_info(0).unwrap().free, free0);
}

#[test]
fn stale_handle_is_rejected() {
    let mut vmm = VirtualMemoryManager::new(host(1, 16 * MIB));
    let reservation = vmm.reserve(0, 8 * MIB).unwrap();
    let original = vmm.allocate(0, &reservation, MIB, None).unwrap();
    let handle = vmm.export(&original).unwrap();
    vmm.deallocate(&original).unwrap();

    // Occupy descriptors so the exported number is likely reused by something else.
    let _other = vmm.allocate(0, &reservation, MIB, None).unwrap();
    assert!(matches!(
        vmm.import(&handle, 0, &reservation, None),
        Err(ReproError::InvalidHandle(_))
    ));
    assert_eq!(vmm.committed_ranges(&reservation).unwrap().len(), 1);
}

#[test]
fn import_rejects_reservation_of_other_device() {
    let mut vmm = VirtualMemoryManager::new(host(2, 16 * MIB));
    let r0 = vmm.reserve(0, 4 * MIB).unwrap();
    let original = vmm.allocate(0, &r0, MIB, None).unwrap();
    let handle = vmm.export(&original).unwrap();
    assert!(matches!(
        vmm.import(&handle, 1, &r0, None),
        Err(ReproError::InvalidHandle(_))
    ));
}

#[test]
fn import_rejects_nonexistent_device() {
    let driver = host(2, 16 * MIB);
    let mut vmm = VirtualMemoryManager::new(Arc::clone(&driver));
    let r0 = vmm.reserve(0, 4 * MIB).unwrap();
    let original = vmm.allocate(0, &r0, MIB, None).unwrap();
    let handle = vmm.export(&original).unwrap();

    assert!(matches!(
        driver.import(2, r0.base + 2 * MIB as u64, &handle),
        Err(ReproError::InvalidHandle(_))
    ));
    assert!(matches!(vmm.reserve(2, 4 * MIB), Err(ReproError::Reservation(_))));
}

#[test]
fn values_from_another_manager_are_invalid_handles() {
    let driver = host(1, 32 * MIB);
    let mut a_vmm = VirtualMemoryManager::new(Arc::clone(&driver));
    let mut b_vmm = VirtualMemoryManager::new(Arc::clone(&driver));

    let ra = a_vmm.reserve(0, 4 * MIB).unwrap();
    let rb = b_vmm.reserve(0, 4 * MIB).unwrap();
    let a = a_vmm.allocate(0, &ra, MIB, None).unwrap();
    let b = b_vmm.allocate(0, &rb, MIB, None).unwrap();
    assert_ne!(a.id, b.id);
    assert_ne!(ra.id, rb.id);

    assert!(matches!(b_vmm.deallocate(&a), Err(ReproError::InvalidHandle(_))));
    assert!(matches!(b_vmm.export(&a), Err(ReproError::InvalidHandle(_))));
    assert!(matches!(
        b_vmm.allocate(0, &ra, MIB, None),
        Err(ReproError::InvalidHandle(_))
    ));
    assert!(matches!(b_vmm.committed_ranges(&ra), Err(ReproError::InvalidHandle(_))));
    assert!(matches!(b_vmm.release(&ra), Err(ReproError::InvalidHandle(_))));

    // A tampered copy of a live value is rejected too.
    let mut forged = b;
    forged.va = a.va;
    assert!(matches!(b_vmm.deallocate(&forged), Err(ReproError::InvalidHandle(_))));

    // Both owners' bookkeeping is untouched.
    assert_eq!(b_vmm.committed_ranges(&rb).unwrap(), vec![(b.offset, MIB)]);
    assert_eq!(a_vmm.committed_ranges(&ra).unwrap(), vec![(a.offset, MIB)]);
    b_vmm.deallocate(&b).unwrap();
    a_vmm.deallocate(&a).unwrap();
    a_vmm.release(&ra).unwrap();
    b_vmm.release(&rb).unwrap();
}

const CHILD_HANDLE_VAR: &str = "HSA_REPRO_TEST_CHILD_HANDLE";
const CHILD_MARK: u8 = 0xC3;

fn child_pattern(i: usize) -> u8 {
    (i * 13 % 256) as u8
}

/// Runs only inside the child spawned by `import_in_child_process_sees_parent_writes`.
#[test]
fn child_imports_handle_from_env() {
    let Ok(hex) = std::env::var(CHILD_HANDLE_VAR) else {
        return;
    };
    let bytes: Vec<u8> = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect();
    let handle = ExportedHandle::from_bytes(&bytes).unwrap();
    assert_ne!(handle.pid(), std::process::id());

    let mut vmm = VirtualMemoryManager::new(host(1, 16 * MIB));
    let reservation = vmm.reserve(0, 4 * MIB).unwrap();
    let view = vmm.import(&handle, 0, &reservation, None).unwrap();

    let mut readback = vec![0u8; MIB];
    unsafe { ptr::copy_nonoverlapping(view.as_ptr(), readback.as_mut_ptr(), MIB) };
    assert!(readback.iter().enumerate().all(|(i, &b)| b == child_pattern(i)));

    unsafe { view.as_ptr().write(CHILD_MARK) };
    vmm.deallocate(&view).unwrap();
}

#[test]
fn import_in_child_process_sees_parent_writes() {
    let mut vmm = VirtualMemoryManager::new(host(1, 16 * MIB));
    let reservation = vmm.reserve(0, 4 * MIB).unwrap();
    let original = vmm.allocate(0, &reservation, MIB, None).unwrap();
    let pattern: Vec<u8> = (0..MIB).map(child_pattern).collect();
    unsafe { ptr::copy_nonoverlapping(pattern.as_ptr(), original.as_ptr(), MIB) };

    let hex: String = vmm
        .export(&original)
        .unwrap()
        .as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    let status = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["child_imports_handle_from_env", "--exact", "--nocapture"])
        .env(CHILD_HANDLE_VAR, hex)
        .status()
        .unwrap();
    assert!(status.success(), "child import failed: {status}");

    // The child's write landed in our pages.
    assert_eq!(unsafe { original.as_ptr().read() }, CHILD_MARK);
    vmm.deallocate(&original).unwrap();
}

#[test]
fn drop_releases_everything() {
    let driver = host(1, 16 * MIB);
    {
        let mut vmm = VirtualMemoryManager::new(Arc::clone(&driver));
        let r = vmm.reserve(0, 8 * MIB).unwrap();
        let a = vmm.allocate(0, &r, 2 * MIB, None).unwrap();
        let h = vmm.export(&a).unwrap();
        vmm.import(&h, 0, &r, None).unwrap();
        assert_eq!(driver.memory_info(0).unwrap().free, 14 * MIB as u64);
    }
    assert_eq!(driver.memory_info(0).unwrap().free, 16 * MIB as u64);
}
