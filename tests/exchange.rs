use hsa_repro::{
    AllGather, ExportedHandle, FileAllGather, HostDriver, MemoryDriver, ReproError,
    ThreadAllGather, VirtualMemoryManager,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MIB: usize = 1 << 20;

/// One real exported handle per rank, each from its own device.
fn handles(world_size: usize) -> (Vec<VirtualMemoryManager>, Vec<ExportedHandle>) {
    let driver: Arc<dyn MemoryDriver> =
        Arc::new(HostDriver::new(world_size as u32, 16 * MIB as u64));
    let mut managers = Vec::new();
    let mut handles = Vec::new();
    for device in 0..world_size as u32 {
        let mut vmm = VirtualMemoryManager::new(Arc::clone(&driver));
        let r = vmm.reserve(device, 2 * MIB).unwrap();
        let a = vmm.allocate(device, &r, MIB, None).unwrap();
        handles.push(vmm.export(&a).unwrap());
        managers.push(vmm);
    }
    (managers, handles)
}

fn gather_on_threads<G: AllGather + Send + Sync + 'static>(
    group: Arc<G>,
    handles: &[ExportedHandle],
) -> Vec<Vec<ExportedHandle>> {
    let world_size = handles.len();
    let workers: Vec<_> = handles
        .iter()
        .copied()
        .enumerate()
        .map(|(rank, h)| {
            let group = Arc::clone(&group);
            thread::spawn(move || group.all_gather(rank, world_size, &h).unwrap())
        })
        .collect();
    workers.into_iter().map(|w| w.join().unwrap()).collect()
}

#[test]
fn thread_group_returns_handles_in_rank_order() {
    let (_managers, handles) = handles(4);
    let group = Arc::new(ThreadAllGather::new(4));

    for _round in 0..3 {
        for gathered in gather_on_threads(Arc::clone(&group), &handles) {
            assert_eq!(gathered, handles);
            for (got, sent) in gathered.iter().zip(&handles) {
                assert_eq!(got.as_bytes(), sent.as_bytes());
            }
        }
    }
}

#[test]
fn thread_group_rejects_bad_ranks() {
    let (_managers, handles) = handles(1);
    let group = ThreadAllGather::new(2);
    assert!(matches!(
        group.all_gather(2, 2, &handles[0]),
        Err(ReproError::Protocol(_))
    ));
    assert!(matches!(
        group.all_gather(0, 3, &handles[0]),
        Err(ReproError::Protocol(_))
    ));
}

#[test]
fn file_group_round_trips_through_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (_managers, handles) = handles(3);
    let group = Arc::new(
        FileAllGather::new(dir.path().join("round-0")).with_poll_interval(Duration::from_millis(1)),
    );

    for gathered in gather_on_threads(group, &handles) {
        assert_eq!(gathered, handles);
    }
    for rank in 0..3 {
        let bytes = std::fs::read(dir.path().join(format!("round-0/rank-{rank}.handle"))).unwrap();
        assert_eq!(bytes, handles[rank].as_bytes());
    }
}

#[test]
fn file_group_times_out_on_missing_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (_managers, handles) = handles(1);
    let group = FileAllGather::new(dir.path())
        .with_poll_interval(Duration::from_millis(1))
        .with_timeout(Duration::from_millis(50));

    let err = group.all_gather(0, 2, &handles[0]).unwrap_err();
    assert!(matches!(err, ReproError::Protocol(ref m) if m.contains("[1]")));
}

#[test]
fn file_group_rejects_corrupt_peer_file() {
    let dir = tempfile::tempdir().unwrap();
    let (_managers, handles) = handles(1);
    std::fs::write(dir.path().join("rank-1.handle"), b"not a handle").unwrap();

    let group = FileAllGather::new(dir.path()).with_poll_interval(Duration::from_millis(1));
    assert!(matches!(
        group.all_gather(0, 2, &handles[0]),
        Err(ReproError::Protocol(_))
    ));
}
