//! Out-of-band all-gather of exported buffer handles.
//!
//! Handles travel as their fixed-size byte encoding and are parsed again on
//! the receiving side, the same way they would cross a process boundary.

use crate::error::{ReproError, ReproResult};
use crate::handle::{EXPORTED_HANDLE_LEN, ExportedHandle};
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Collective exchange of one handle per rank.
///
/// Every rank calls `all_gather` with its own handle; each call returns all
/// `world_size` handles ordered by rank.
pub trait AllGather {
    fn all_gather(
        &self,
        rank: usize,
        world_size: usize,
        handle: &ExportedHandle,
    ) -> ReproResult<Vec<ExportedHandle>>;
}

impl<T: AllGather + ?Sized> AllGather for Arc<T> {
    fn all_gather(
        &self,
        rank: usize,
        world_size: usize,
        handle: &ExportedHandle,
    ) -> ReproResult<Vec<ExportedHandle>> {
        (**self).all_gather(rank, world_size, handle)
    }
}

fn check_rank(rank: usize, world_size: usize) -> ReproResult<()> {
    if world_size == 0 || rank >= world_size {
        return Err(ReproError::Protocol(format!(
            "rank {rank} is outside a world of {world_size}"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct Round {
    epoch: u64,
    slots: Vec<Option<[u8; EXPORTED_HANDLE_LEN]>>,
    filled: usize,
    result: Vec<[u8; EXPORTED_HANDLE_LEN]>,
}

/// In-process rendezvous for runs with one thread per device.
///
/// Reusable: once all ranks have gathered, the next call starts a new round.
#[derive(Debug)]
pub struct ThreadAllGather {
    world_size: usize,
    round: Mutex<Round>,
    cond: Condvar,
}

impl ThreadAllGather {
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            round: Mutex::new(Round {
                epoch: 0,
                slots: vec![None; world_size],
                filled: 0,
                result: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

impl AllGather for ThreadAllGather {
    fn all_gather(
        &self,
        rank: usize,
        world_size: usize,
        handle: &ExportedHandle,
    ) -> ReproResult<Vec<ExportedHandle>> {
        check_rank(rank, world_size)?;
        if world_size != self.world_size {
            return Err(ReproError::Protocol(format!(
                "world size {world_size} does not match the group's {}",
                self.world_size
            )));
        }

        let mut round = self.round.lock();
        if round.slots[rank].is_some() {
            return Err(ReproError::Protocol(format!(
                "rank {rank} already contributed to this round"
            )));
        }
        let epoch = round.epoch;
        round.slots[rank] = Some(handle.to_bytes());
        round.filled += 1;

        if round.filled == world_size {
            round.result = round.slots.iter_mut().filter_map(Option::take).collect();
            round.filled = 0;
            round.epoch += 1;
            self.cond.notify_all();
        } else {
            while round.epoch == epoch {
                self.cond.wait(&mut round);
            }
        }

        round
            .result
            .iter()
            .map(|bytes| ExportedHandle::from_bytes(bytes))
            .collect()
    }
}

/// Rendezvous through a shared directory, for runs with one process per device.
///
/// Rank `n` publishes `rank-<n>.handle` with a write-then-rename, then polls
/// until every rank's file is present. A directory serves a single round.
#[derive(Debug, Clone)]
pub struct FileAllGather {
    dir: PathBuf,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl FileAllGather {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(10),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Gives up waiting for peers after `timeout`. Without one, a missing peer
    /// blocks forever.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("rank-{rank}.handle"))
    }

    fn publish(&self, rank: usize, handle: &ExportedHandle) -> ReproResult<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp = self
            .dir
            .join(format!(".rank-{rank}.handle.{}", std::process::id()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(handle.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.path_of(rank))?;
        Ok(())
    }

    fn try_read(&self, rank: usize) -> ReproResult<Option<ExportedHandle>> {
        match fs::read(self.path_of(rank)) {
            Ok(bytes) => ExportedHandle::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| ReproError::Protocol(format!("rank {rank} published a bad handle: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl AllGather for FileAllGather {
    fn all_gather(
        &self,
        rank: usize,
        world_size: usize,
        handle: &ExportedHandle,
    ) -> ReproResult<Vec<ExportedHandle>> {
        check_rank(rank, world_size)?;
        self.publish(rank, handle)?;
        tracing::debug!(rank, world_size, dir = %self.dir.display(), "published handle");

        let start = Instant::now();
        let mut gathered: Vec<Option<ExportedHandle>> = vec![None; world_size];
        loop {
            for (peer, slot) in gathered.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = self.try_read(peer)?;
                }
            }
            if gathered.iter().all(Option::is_some) {
                return Ok(gathered.into_iter().flatten().collect());
            }

            if let Some(limit) = self.timeout
                && start.elapsed() > limit
            {
                let missing: Vec<usize> = gathered
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.is_none())
                    .map(|(r, _)| r)
                    .collect();
                return Err(ReproError::Protocol(format!(
                    "timed out after {limit:?} waiting for ranks {missing:?}"
                )));
            }
            thread::sleep(self.poll_interval);
        }
    }
}
