use crate::utils::align_up;
use std::collections::BTreeMap;

/// Why a sub-range could not be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeConflict {
    /// The range does not lie inside `[base, end)` or is not aligned.
    OutOfBounds,
    /// The range intersects an existing claim starting at `start`.
    Overlap { start: u64, size: u64 },
    /// No hole large enough remains.
    Exhausted,
}

/// First-fit bookkeeping over a contiguous address range.
///
/// Serves both as the per-reservation commit map (offsets relative to the
/// reservation) and as the KFD driver's virtual-address aperture.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    base: u64,
    end: u64,
    align: u64,
    guard_size: u64,

    // Start -> size, including guard pages on both sides.
    claims: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    /// `end` is exclusive. `align` must be a power of two.
    #[must_use]
    pub fn new(base: u64, end: u64, align: u64, guard_size: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self {
            base,
            end,
            align,
            guard_size,
            claims: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Claims the lowest hole that fits `size` bytes at `align` (or the allocator's
    /// own alignment if larger). Returns the usable start, past the leading guard.
    pub fn allocate_first_fit(&mut self, size: u64, align: u64) -> Result<u64, RangeConflict> {
        if size == 0 {
            return Err(RangeConflict::OutOfBounds);
        }
        let align = align.max(self.align);
        let request = size
            .checked_add(self.guard_size * 2)
            .ok_or(RangeConflict::Exhausted)?;

        let mut candidate = align_up(self.base, align);

        for (&start, &len) in &self.claims {
            if start >= candidate && start - candidate >= request {
                break;
            }
            candidate = candidate.max(align_up(start + len, align));
        }

        match candidate.checked_add(request) {
            Some(stop) if stop <= self.end => {
                self.claims.insert(candidate, request);
                Ok(candidate + self.guard_size)
            }
            _ => Err(RangeConflict::Exhausted),
        }
    }

    /// Claims exactly `[start, start + size)`.
    pub fn claim(&mut self, start: u64, size: u64) -> Result<u64, RangeConflict> {
        if size == 0 || start % self.align != 0 {
            return Err(RangeConflict::OutOfBounds);
        }
        let tracked = start
            .checked_sub(self.guard_size)
            .ok_or(RangeConflict::OutOfBounds)?;
        let request = size + self.guard_size * 2;
        let stop = tracked
            .checked_add(request)
            .ok_or(RangeConflict::OutOfBounds)?;
        if tracked < self.base || stop > self.end {
            return Err(RangeConflict::OutOfBounds);
        }

        // Predecessor may extend into us; any successor must start at or past `stop`.
        if let Some((&prev, &len)) = self.claims.range(..=tracked).next_back()
            && prev + len > tracked
        {
            return Err(RangeConflict::Overlap {
                start: prev + self.guard_size,
                size: len - self.guard_size * 2,
            });
        }
        if let Some((&next, &len)) = self.claims.range(tracked..).next()
            && next < stop
        {
            return Err(RangeConflict::Overlap {
                start: next + self.guard_size,
                size: len - self.guard_size * 2,
            });
        }

        self.claims.insert(tracked, request);
        Ok(start)
    }

    /// Releases the claim whose usable range starts at `start`, returning its usable size.
    pub fn release(&mut self, start: u64) -> Option<u64> {
        let tracked = start.checked_sub(self.guard_size)?;
        self.claims
            .remove(&tracked)
            .map(|len| len - self.guard_size * 2)
    }

    /// Usable `(start, size)` pairs in ascending order.
    #[must_use]
    pub fn claims(&self) -> Vec<(u64, u64)> {
        self.claims
            .iter()
            .map(|(&s, &len)| (s + self.guard_size, len - self.guard_size * 2))
            .collect()
    }
}
