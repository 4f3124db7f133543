use {
    crate::{config::OPS_BEFORE_BUDGET_REPOLL, stats::Budget},
    core::sync::atomic::{AtomicU32, AtomicU64, Ordering},
    gpu_suballoc_types::{HeapBudget, MemoryDevice, MemoryHeap},
    parking_lot::RwLock,
};

#[derive(Debug, Default)]
struct HeapCounters {
    /// Raw device memory held by the allocator.
    block_bytes: AtomicU64,
    /// Bytes handed out to live allocations.
    allocation_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
struct FetchedBudget {
    usage: u64,
    budget: u64,
    block_bytes_at_fetch: u64,
}

/// Per-heap byte accounting against driver-reported or heuristic limits.
///
/// The live counters are lock-free atomics; only the periodic driver
/// re-poll takes the write side of a lock.
#[derive(Debug)]
pub(crate) struct BudgetTracker {
    heaps: Box<[HeapCounters]>,
    heap_sizes: Box<[u64]>,
    /// User ceilings on `block_bytes`, `u64::MAX` when unlimited.
    heap_limits: Box<[u64]>,
    fetched: RwLock<Box<[FetchedBudget]>>,
    ops_since_fetch: AtomicU32,
    budget_queries: bool,
}

impl BudgetTracker {
    pub(crate) fn new(
        heaps: &[MemoryHeap],
        limits: Option<&[Option<u64>]>,
        budget_queries: bool,
    ) -> Self {
        if let Some(limits) = limits {
            assert_eq!(
                limits.len(),
                heaps.len(),
                "`heap_size_limits` must have one entry per device heap"
            );
        }

        BudgetTracker {
            heaps: heaps.iter().map(|_| HeapCounters::default()).collect(),
            heap_sizes: heaps.iter().map(|heap| heap.size).collect(),
            heap_limits: heaps
                .iter()
                .enumerate()
                .map(|(index, _)| {
                    limits
                        .and_then(|limits| limits[index])
                        .unwrap_or(u64::MAX)
                })
                .collect(),
            // until the first poll the driver budget defaults to the same
            // 80% heuristic used without the capability
            fetched: RwLock::new(
                heaps
                    .iter()
                    .map(|heap| FetchedBudget {
                        usage: 0,
                        budget: heap.size / 10 * 8,
                        block_bytes_at_fetch: 0,
                    })
                    .collect(),
            ),
            ops_since_fetch: AtomicU32::new(0),
            budget_queries,
        }
    }

    /// Reserves `size` bytes of raw block memory on `heap`, enforcing the
    /// user heap limit with a compare-and-swap loop. Nothing is reserved on
    /// failure.
    pub(crate) fn try_add_block(&self, heap: usize, size: u64) -> bool {
        let counter = &self.heaps[heap].block_bytes;
        let limit = self.heap_limits[heap];
        if limit == u64::MAX {
            counter.fetch_add(size, Ordering::Relaxed);
            return true;
        }

        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let new = match current.checked_add(size) {
                Some(new) if new <= limit => new,
                _ => return false,
            };
            match counter.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn sub_block(&self, heap: usize, size: u64) {
        self.heaps[heap].block_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn add_allocation(&self, heap: usize, size: u64) {
        self.heaps[heap]
            .allocation_bytes
            .fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn sub_allocation(&self, heap: usize, size: u64) {
        self.heaps[heap]
            .allocation_bytes
            .fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Records one successful allocation and re-polls the driver budget
    /// after every [`OPS_BEFORE_BUDGET_REPOLL`] of them.
    pub(crate) fn note_successful_allocation<M>(&self, device: &impl MemoryDevice<M>) {
        if !self.budget_queries {
            return;
        }
        if self.ops_since_fetch.fetch_add(1, Ordering::Relaxed) + 1 >= OPS_BEFORE_BUDGET_REPOLL {
            self.fetch(device);
        }
    }

    /// Polls the driver budget, sanitizing anomalous values.
    pub(crate) fn fetch<M>(&self, device: &impl MemoryDevice<M>) {
        let mut fetched = self.fetched.write();

        let mut reported = vec![HeapBudget::default(); fetched.len()];
        match device.query_memory_budget(&mut reported) {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!("Memory budget query failed: {:?}", err);
                return;
            }
        }

        for (heap, entry) in fetched.iter_mut().enumerate() {
            let heap_size = self.heap_sizes[heap];
            let block_bytes = self.heaps[heap].block_bytes.load(Ordering::Relaxed);

            let mut budget = reported[heap].budget;
            if budget == 0 {
                budget = heap_size / 10 * 8;
            } else if budget > heap_size {
                budget = heap_size;
            }

            let mut usage = reported[heap].usage;
            if usage == 0 && block_bytes > 0 {
                usage = block_bytes;
            }

            *entry = FetchedBudget {
                usage,
                budget,
                block_bytes_at_fetch: block_bytes,
            };
        }

        self.ops_since_fetch.store(0, Ordering::Relaxed);
    }

    /// Current accounting of one heap. Usage is extrapolated from the last
    /// driver poll by the block bytes acquired or released since.
    pub(crate) fn report(&self, heap: usize) -> Budget {
        let block_bytes = self.heaps[heap].block_bytes.load(Ordering::Relaxed);
        let allocation_bytes = self.heaps[heap].allocation_bytes.load(Ordering::Relaxed);

        if self.budget_queries {
            let fetched = self.fetched.read()[heap];
            let usage = if block_bytes >= fetched.block_bytes_at_fetch {
                fetched.usage + (block_bytes - fetched.block_bytes_at_fetch)
            } else {
                fetched
                    .usage
                    .saturating_sub(fetched.block_bytes_at_fetch - block_bytes)
            };
            Budget {
                block_bytes,
                allocation_bytes,
                usage,
                budget: fetched.budget,
            }
        } else {
            Budget {
                block_bytes,
                allocation_bytes,
                usage: block_bytes,
                budget: self.heap_sizes[heap] / 10 * 8,
            }
        }
    }

    /// Refreshes the driver budget and checks whether `size` more bytes on
    /// `heap` would stay within it.
    pub(crate) fn fits_within_budget<M>(
        &self,
        device: &impl MemoryDevice<M>,
        heap: usize,
        size: u64,
    ) -> bool {
        if self.budget_queries {
            self.fetch(device);
        }
        let budget = self.report(heap);
        budget.usage.saturating_add(size) <= budget.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAPS: &[MemoryHeap] = &[MemoryHeap { size: 1024 }, MemoryHeap { size: 4096 }];

    #[test]
    fn heap_limit_is_enforced() {
        let limits = [Some(512), None];
        let tracker = BudgetTracker::new(HEAPS, Some(&limits), false);

        assert!(tracker.try_add_block(0, 500));
        assert!(!tracker.try_add_block(0, 64));
        assert_eq!(tracker.report(0).block_bytes, 500);

        tracker.sub_block(0, 100);
        assert!(tracker.try_add_block(0, 64));
        assert_eq!(tracker.report(0).block_bytes, 464);

        // the unlimited heap takes anything
        assert!(tracker.try_add_block(1, 1 << 40));
    }

    #[test]
    fn heuristic_budget_without_queries() {
        let tracker = BudgetTracker::new(HEAPS, None, false);
        tracker.try_add_block(1, 128);
        tracker.add_allocation(1, 100);

        let budget = tracker.report(1);
        assert_eq!(budget.block_bytes, 128);
        assert_eq!(budget.allocation_bytes, 100);
        assert_eq!(budget.usage, 128);
        assert_eq!(budget.budget, 4096 / 10 * 8);
    }
}
