use {
    crate::{handle::AllocationInner, stats::PoolStatistics},
    parking_lot::RwLock,
    std::sync::Arc,
};

/// Set of live dedicated allocations of one memory type, ordered by
/// allocation identity. Reads are frequent, writes rare.
#[derive(Debug)]
pub(crate) struct DedicatedSet<M> {
    items: RwLock<Vec<Arc<AllocationInner<M>>>>,
}

impl<M> DedicatedSet<M> {
    pub(crate) fn new() -> Self {
        DedicatedSet {
            items: RwLock::new(Vec::new()),
        }
    }

    fn position(items: &[Arc<AllocationInner<M>>], inner: &AllocationInner<M>) -> Result<usize, usize> {
        items.binary_search_by_key(&(inner as *const AllocationInner<M> as usize), |item| {
            Arc::as_ptr(item) as usize
        })
    }

    pub(crate) fn insert(&self, inner: Arc<AllocationInner<M>>) {
        let mut items = self.items.write();
        let (Ok(position) | Err(position)) = Self::position(&items, &inner);
        items.insert(position, inner);
    }

    /// Removes the allocation. Returns `false` when it was not registered.
    pub(crate) fn remove(&self, inner: &AllocationInner<M>) -> bool {
        let mut items = self.items.write();
        match Self::position(&items, inner) {
            Ok(position) => {
                items.remove(position);
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.read().len()
    }

    pub(crate) fn collect_stats(&self, stats: &mut PoolStatistics) {
        let items = self.items.read();
        for item in items.iter() {
            stats.block_count += 1;
            stats.allocation_count += 1;
            stats.size += item.size;
        }
    }
}
