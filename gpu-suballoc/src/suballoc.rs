use {
    crate::{
        align_up,
        config::{DEBUG_MARGIN, LOST_ALLOCATION_COST, MIN_FREE_SUBALLOC_SIZE_TO_REGISTER},
        handle::AllocationInner,
        stats::PoolStatistics,
    },
    slab::Slab,
    std::sync::Arc,
};

/// Kind of resource occupying a suballocation, used to keep linear and
/// non-linear resources apart on one granularity page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuballocationType {
    Free,
    Unknown,
    Buffer,
    ImageUnknown,
    ImageLinear,
    ImageOptimal,
}

impl SuballocationType {
    /// Whether two resources of these kinds may not share one granularity
    /// page. `Free` never conflicts, `Unknown` conflicts with everything
    /// else, and the remaining kinds conflict whenever they differ.
    pub(crate) fn conflicts_with(self, other: SuballocationType) -> bool {
        use SuballocationType::*;
        match (self, other) {
            (Free, _) | (_, Free) => false,
            (Unknown, _) | (_, Unknown) => true,
            _ => self != other,
        }
    }
}

/// Whether the end of range `[a_offset, a_offset + a_size)` and the start of
/// the range at `b_offset` land on the same `page_size` page.
fn on_same_page(a_offset: u64, a_size: u64, b_offset: u64, page_size: u64) -> bool {
    debug_assert!(a_offset + a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);
    debug_assert!(page_size.is_power_of_two());

    let a_end_page = (a_offset + a_size - 1) & !(page_size - 1);
    let b_start_page = b_offset & !(page_size - 1);
    a_end_page == b_start_page
}

/// One contiguous range of a block, either free or owned by an allocation.
#[derive(Debug)]
struct Suballocation<M> {
    offset: u64,
    size: u64,
    kind: SuballocationType,
    owner: Option<Arc<AllocationInner<M>>>,
}

#[derive(Debug)]
struct Node<M> {
    prev: Option<usize>,
    next: Option<usize>,
    suballoc: Suballocation<M>,
}

/// Placement order tried within a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PlacementStrategy {
    /// Smallest free range that fits.
    BestFit,
    /// Largest free range first.
    FirstFit,
    /// Largest free range first, keeping big ranges in use.
    WorstFit,
    /// Lowest offset that fits, walking the block front to back.
    /// Reserved for compaction passes.
    #[allow(dead_code)]
    MinOffset,
}

/// Parameters of one placement attempt.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RequestContext {
    pub size: u64,
    pub alignment: u64,
    pub granularity: u64,
    pub kind: SuballocationType,
    pub strategy: PlacementStrategy,
    pub current_frame: u32,
    pub frame_in_use_count: u32,
    pub can_make_other_lost: bool,
}

/// Successful placement, to be passed to [`BlockMetadata::commit`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct AllocationRequest {
    /// Anchor node. A free node for ordinary requests; the first node of the
    /// reclaimed span for requests that make other allocations lost.
    pub node: usize,
    /// Aligned offset the allocation will be placed at.
    pub offset: u64,
    pub items_to_make_lost: usize,
    pub sum_item_size: u64,
}

impl AllocationRequest {
    /// Cost of executing this request, for comparing candidates across
    /// blocks. Reclaimed bytes plus a fixed toll per reclaimed allocation.
    pub(crate) fn cost(&self) -> u64 {
        self.sum_item_size + self.items_to_make_lost as u64 * LOST_ALLOCATION_COST
    }
}

/// Sub-allocation state of one device memory block: an offset-ordered list
/// of suballocations covering the whole block without gaps, plus an index of
/// free ranges sorted ascending by size.
#[derive(Debug)]
pub(crate) struct BlockMetadata<M> {
    block_size: u64,
    nodes: Slab<Node<M>>,
    head: usize,
    tail: usize,
    free_count: usize,
    sum_free: u64,
    /// Keys of free nodes of at least `MIN_FREE_SUBALLOC_SIZE_TO_REGISTER`
    /// bytes, sorted ascending by (size, offset).
    free_index: Vec<usize>,
}

impl<M> BlockMetadata<M> {
    pub(crate) fn new(block_size: u64) -> Self {
        let mut nodes = Slab::with_capacity(32);
        let root = nodes.insert(Node {
            prev: None,
            next: None,
            suballoc: Suballocation {
                offset: 0,
                size: block_size,
                kind: SuballocationType::Free,
                owner: None,
            },
        });

        BlockMetadata {
            block_size,
            nodes,
            head: root,
            tail: root,
            free_count: 1,
            sum_free: block_size,
            free_index: vec![root],
        }
    }

    #[inline]
    pub(crate) fn sum_free(&self) -> u64 {
        self.sum_free
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.free_count == 1 && self.sum_free == self.block_size
    }

    #[inline]
    pub(crate) fn allocation_count(&self) -> usize {
        self.nodes.len() - self.free_count
    }

    /// Tries to place an allocation according to `ctx` without mutating
    /// anything. In `can_make_other_lost` mode the returned request is the
    /// lowest-cost candidate within this block.
    pub(crate) fn try_request(&self, ctx: &RequestContext) -> Option<AllocationRequest> {
        let needed = ctx.size + 2 * DEBUG_MARGIN;

        if self.sum_free >= needed {
            match ctx.strategy {
                PlacementStrategy::BestFit => {
                    let start = self
                        .free_index
                        .partition_point(|&key| self.nodes[key].suballoc.size < needed);
                    for &key in &self.free_index[start..] {
                        if let Some(offset) = self.check_free_candidate(key, ctx) {
                            return Some(AllocationRequest {
                                node: key,
                                offset,
                                items_to_make_lost: 0,
                                sum_item_size: 0,
                            });
                        }
                    }
                }
                PlacementStrategy::MinOffset => {
                    let mut cursor = Some(self.head);
                    while let Some(key) = cursor {
                        cursor = self.nodes[key].next;
                        if self.nodes[key].suballoc.kind != SuballocationType::Free {
                            continue;
                        }
                        if let Some(offset) = self.check_free_candidate(key, ctx) {
                            return Some(AllocationRequest {
                                node: key,
                                offset,
                                items_to_make_lost: 0,
                                sum_item_size: 0,
                            });
                        }
                    }
                }
                PlacementStrategy::FirstFit | PlacementStrategy::WorstFit => {
                    for &key in self.free_index.iter().rev() {
                        if let Some(offset) = self.check_free_candidate(key, ctx) {
                            return Some(AllocationRequest {
                                node: key,
                                offset,
                                items_to_make_lost: 0,
                                sum_item_size: 0,
                            });
                        }
                    }
                }
            }
        }

        if ctx.can_make_other_lost {
            let mut best: Option<AllocationRequest> = None;
            let mut cursor = Some(self.head);
            while let Some(key) = cursor {
                cursor = self.nodes[key].next;
                if let Some(request) = self.check_lost_candidate(key, ctx) {
                    if best
                        .as_ref()
                        .map_or(true, |prev| request.cost() < prev.cost())
                    {
                        best = Some(request);
                    }
                }
            }
            return best;
        }

        None
    }

    /// Checks one free node as a placement candidate, returning the aligned
    /// offset the allocation would get.
    fn check_free_candidate(&self, key: usize, ctx: &RequestContext) -> Option<u64> {
        let node = &self.nodes[key];
        let sub = &node.suballoc;
        debug_assert_eq!(sub.kind, SuballocationType::Free);

        if sub.size < ctx.size + 2 * DEBUG_MARGIN {
            return None;
        }

        let mut offset = align_up(sub.offset + DEBUG_MARGIN, ctx.alignment);

        // A conflicting neighbour ending on our page pushes the allocation
        // to the next granularity page.
        if ctx.granularity > 1 {
            let mut prev = node.prev;
            while let Some(p) = prev {
                let prev_sub = &self.nodes[p].suballoc;
                if !on_same_page(prev_sub.offset, prev_sub.size, offset, ctx.granularity) {
                    break;
                }
                if prev_sub.kind.conflicts_with(ctx.kind) {
                    offset = align_up(offset, ctx.granularity);
                    break;
                }
                prev = self.nodes[p].prev;
            }
        }

        let padding_begin = offset - sub.offset;
        if padding_begin + ctx.size + DEBUG_MARGIN > sub.size {
            return None;
        }

        // A conflicting neighbour starting on our last page rejects the
        // candidate outright.
        if ctx.granularity > 1 {
            let mut next = node.next;
            while let Some(n) = next {
                let next_sub = &self.nodes[n].suballoc;
                if !on_same_page(offset, ctx.size, next_sub.offset, ctx.granularity) {
                    break;
                }
                if ctx.kind.conflicts_with(next_sub.kind) {
                    return None;
                }
                next = self.nodes[n].next;
            }
        }

        Some(offset)
    }

    /// Checks a node as the anchor of a request that may reclaim stale
    /// allocations, accumulating the reclaim count and byte sum.
    fn check_lost_candidate(&self, key: usize, ctx: &RequestContext) -> Option<AllocationRequest> {
        let node = &self.nodes[key];
        let sub = &node.suballoc;

        let mut items_to_make_lost = 0;
        let mut sum_item_size = 0;

        if sub.kind != SuballocationType::Free {
            let owner = sub.owner.as_ref()?;
            if !owner.can_become_lost
                || !owner.is_stale(ctx.current_frame, ctx.frame_in_use_count)
            {
                return None;
            }
            items_to_make_lost += 1;
            sum_item_size += sub.size;
        }

        let mut offset = align_up(sub.offset + DEBUG_MARGIN, ctx.alignment);

        if ctx.granularity > 1 {
            let mut prev = node.prev;
            while let Some(p) = prev {
                let prev_sub = &self.nodes[p].suballoc;
                if !on_same_page(prev_sub.offset, prev_sub.size, offset, ctx.granularity) {
                    break;
                }
                if prev_sub.kind.conflicts_with(ctx.kind) {
                    offset = align_up(offset, ctx.granularity);
                    break;
                }
                prev = self.nodes[p].prev;
            }
        }

        if offset + ctx.size + DEBUG_MARGIN > self.block_size {
            return None;
        }

        // Extend the span over following records until it covers the
        // request; every live record in the way must be reclaimable.
        let mut last = key;
        loop {
            let last_sub = &self.nodes[last].suballoc;
            if offset + ctx.size + DEBUG_MARGIN <= last_sub.offset + last_sub.size {
                break;
            }

            let next = self.nodes[last].next?;
            let next_sub = &self.nodes[next].suballoc;
            if next_sub.kind != SuballocationType::Free {
                let owner = next_sub.owner.as_ref()?;
                if !owner.can_become_lost
                    || !owner.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                {
                    return None;
                }
                items_to_make_lost += 1;
                sum_item_size += next_sub.size;
            }
            last = next;
        }

        // Conflicting records past the span but on its final page must be
        // reclaimed as well.
        if ctx.granularity > 1 {
            let mut next = self.nodes[last].next;
            while let Some(n) = next {
                let next_sub = &self.nodes[n].suballoc;
                if !on_same_page(offset, ctx.size, next_sub.offset, ctx.granularity) {
                    break;
                }
                if ctx.kind.conflicts_with(next_sub.kind) {
                    let owner = next_sub.owner.as_ref()?;
                    if !owner.can_become_lost
                        || !owner.is_stale(ctx.current_frame, ctx.frame_in_use_count)
                    {
                        return None;
                    }
                    items_to_make_lost += 1;
                    sum_item_size += next_sub.size;
                }
                next = self.nodes[n].next;
            }
        }

        Some(AllocationRequest {
            node: key,
            offset,
            items_to_make_lost,
            sum_item_size,
        })
    }

    /// Reclaims the allocations a request counted, flipping each owner to
    /// the lost state and recycling its record. Returns the reclaimed bytes,
    /// or `None` if some target was used again since the request was built.
    /// On success `request.node` is the free node to commit into.
    pub(crate) fn make_requested_lost(
        &mut self,
        request: &mut AllocationRequest,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> Option<u64> {
        let mut reclaimed = 0;

        while request.items_to_make_lost > 0 {
            if self.nodes[request.node].suballoc.kind == SuballocationType::Free {
                request.node = self.nodes[request.node]
                    .next
                    .expect("reclaim span ran past the end of the block");
                continue;
            }

            let sub = &self.nodes[request.node].suballoc;
            let owner = sub.owner.clone().expect("live suballocation without owner");
            if !owner.can_become_lost || !owner.try_make_lost(current_frame, frame_in_use_count) {
                return None;
            }

            reclaimed += sub.size;
            request.node = self.free_node(request.node);
            request.items_to_make_lost -= 1;
        }

        debug_assert_eq!(
            self.nodes[request.node].suballoc.kind,
            SuballocationType::Free
        );
        Some(reclaimed)
    }

    /// Reclaims every stale allocation in the block.
    /// Returns the count and byte sum of reclaimed allocations.
    pub(crate) fn make_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> (usize, u64) {
        let mut stale = Vec::new();
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            cursor = self.nodes[key].next;
            let sub = &self.nodes[key].suballoc;
            if let Some(owner) = &sub.owner {
                if owner.can_become_lost && owner.try_make_lost(current_frame, frame_in_use_count)
                {
                    stale.push(key);
                }
            }
        }

        let mut bytes = 0;
        for key in &stale {
            bytes += self.nodes[*key].suballoc.size;
            self.free_node(*key);
        }
        (stale.len(), bytes)
    }

    /// Turns the free node of a successful request into an allocation,
    /// splitting off leading and trailing padding as new free records.
    pub(crate) fn commit(
        &mut self,
        request: AllocationRequest,
        kind: SuballocationType,
        size: u64,
        owner: Arc<AllocationInner<M>>,
    ) {
        debug_assert_ne!(kind, SuballocationType::Free);
        debug_assert_eq!(request.items_to_make_lost, 0);

        let key = request.node;
        debug_assert_eq!(self.nodes[key].suballoc.kind, SuballocationType::Free);

        self.unregister_free(key);

        let node_offset = self.nodes[key].suballoc.offset;
        let node_size = self.nodes[key].suballoc.size;
        let padding_begin = request.offset - node_offset;
        let padding_end = node_size - padding_begin - size;

        self.nodes[key].suballoc = Suballocation {
            offset: request.offset,
            size,
            kind,
            owner: Some(owner),
        };
        self.free_count -= 1;
        self.sum_free -= node_size;

        if padding_end > 0 {
            let padding = self.insert_after(key, request.offset + size, padding_end);
            self.free_count += 1;
            self.sum_free += padding_end;
            self.register_free(padding);
        }
        if padding_begin > 0 {
            let padding = self.insert_before(key, node_offset, padding_begin);
            self.free_count += 1;
            self.sum_free += padding_begin;
            self.register_free(padding);
        }

        debug_assert!(self.validate());
    }

    /// Frees the suballocation owned by `owner`. Returns the freed size.
    pub(crate) fn free(&mut self, owner: &AllocationInner<M>) -> u64 {
        self.free_at_offset(owner.offset_raw())
    }

    /// Frees the suballocation at `offset`. Returns the freed size.
    pub(crate) fn free_at_offset(&mut self, offset: u64) -> u64 {
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let sub = &self.nodes[key].suballoc;
            if sub.offset == offset && sub.kind != SuballocationType::Free {
                let size = sub.size;
                self.free_node(key);
                debug_assert!(self.validate());
                return size;
            }
            if sub.offset > offset {
                break;
            }
            cursor = self.nodes[key].next;
        }
        panic!("no live suballocation at offset {}", offset);
    }

    /// Marks a node free and eagerly merges it with free neighbours.
    /// Returns the key of the resulting free node.
    fn free_node(&mut self, key: usize) -> usize {
        {
            let sub = &mut self.nodes[key].suballoc;
            debug_assert_ne!(sub.kind, SuballocationType::Free);
            self.sum_free += sub.size;
            sub.kind = SuballocationType::Free;
            sub.owner = None;
        }
        self.free_count += 1;

        if let Some(next) = self.nodes[key].next {
            if self.nodes[next].suballoc.kind == SuballocationType::Free {
                self.unregister_free(next);
                let merged_size = self.nodes[next].suballoc.size;
                self.nodes[key].suballoc.size += merged_size;
                self.remove_node(next);
                self.free_count -= 1;
            }
        }

        let mut merged = key;
        if let Some(prev) = self.nodes[key].prev {
            if self.nodes[prev].suballoc.kind == SuballocationType::Free {
                self.unregister_free(prev);
                let merged_size = self.nodes[key].suballoc.size;
                self.nodes[prev].suballoc.size += merged_size;
                self.remove_node(key);
                self.free_count -= 1;
                merged = prev;
            }
        }

        self.register_free(merged);
        merged
    }

    pub(crate) fn collect_stats(&self, stats: &mut PoolStatistics) {
        stats.block_count += 1;
        stats.size += self.block_size;
        stats.unused_size += self.sum_free;
        stats.allocation_count += self.allocation_count();
        stats.unused_range_count += self.free_count;

        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let sub = &self.nodes[key].suballoc;
            if sub.kind == SuballocationType::Free {
                stats.largest_unused_range = stats.largest_unused_range.max(sub.size);
            }
            cursor = self.nodes[key].next;
        }
    }

    /// Checks every structural invariant. Intended for debug assertions and
    /// tests.
    pub(crate) fn validate(&self) -> bool {
        macro_rules! check {
            ($cond:expr) => {
                if !$cond {
                    return false;
                }
            };
        }

        let mut calc_offset = 0;
        let mut calc_sum_free = 0;
        let mut calc_free_count = 0;
        let mut calc_registered = 0;
        let mut prev_free = false;
        let mut count = 0;

        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            let sub = &node.suballoc;
            count += 1;

            check!(sub.offset == calc_offset);
            check!(sub.size > 0);

            if sub.kind == SuballocationType::Free {
                // adjacent free records must have been merged
                check!(!prev_free);
                check!(sub.owner.is_none());
                calc_sum_free += sub.size;
                calc_free_count += 1;
                if sub.size >= MIN_FREE_SUBALLOC_SIZE_TO_REGISTER {
                    check!(self.free_index.contains(&key));
                    calc_registered += 1;
                }
                prev_free = true;
            } else {
                let owner = match &sub.owner {
                    Some(owner) => owner,
                    None => return false,
                };
                check!(owner.offset_raw() == sub.offset);
                check!(owner.size == sub.size);
                check!(owner.kind == sub.kind);
                prev_free = false;
            }

            calc_offset += sub.size;
            if node.next.is_none() {
                check!(key == self.tail);
            }
            cursor = node.next;
        }

        check!(calc_offset == self.block_size);
        check!(calc_sum_free == self.sum_free);
        check!(calc_free_count == self.free_count);
        check!(count == self.nodes.len());
        check!(calc_registered == self.free_index.len());

        for pair in self.free_index.windows(2) {
            let a = &self.nodes[pair[0]].suballoc;
            let b = &self.nodes[pair[1]].suballoc;
            check!((a.size, a.offset) < (b.size, b.offset));
        }

        true
    }

    fn free_index_position(&self, size: u64, offset: u64) -> Result<usize, usize> {
        self.free_index.binary_search_by(|&key| {
            let sub = &self.nodes[key].suballoc;
            (sub.size, sub.offset).cmp(&(size, offset))
        })
    }

    fn register_free(&mut self, key: usize) {
        let sub = &self.nodes[key].suballoc;
        if sub.size < MIN_FREE_SUBALLOC_SIZE_TO_REGISTER {
            return;
        }
        let (Ok(position) | Err(position)) = self.free_index_position(sub.size, sub.offset);
        self.free_index.insert(position, key);
    }

    fn unregister_free(&mut self, key: usize) {
        let sub = &self.nodes[key].suballoc;
        if sub.size < MIN_FREE_SUBALLOC_SIZE_TO_REGISTER {
            return;
        }
        let position = self
            .free_index_position(sub.size, sub.offset)
            .expect("free suballocation missing from the size index");
        debug_assert_eq!(self.free_index[position], key);
        self.free_index.remove(position);
    }

    fn insert_after(&mut self, key: usize, offset: u64, size: u64) -> usize {
        let next = self.nodes[key].next;
        let new = self.nodes.insert(Node {
            prev: Some(key),
            next,
            suballoc: Suballocation {
                offset,
                size,
                kind: SuballocationType::Free,
                owner: None,
            },
        });
        self.nodes[key].next = Some(new);
        match next {
            Some(n) => self.nodes[n].prev = Some(new),
            None => self.tail = new,
        }
        new
    }

    fn insert_before(&mut self, key: usize, offset: u64, size: u64) -> usize {
        let prev = self.nodes[key].prev;
        let new = self.nodes.insert(Node {
            prev,
            next: Some(key),
            suballoc: Suballocation {
                offset,
                size,
                kind: SuballocationType::Free,
                owner: None,
            },
        });
        self.nodes[key].prev = Some(new);
        match prev {
            Some(p) => self.nodes[p].next = Some(new),
            None => self.head = new,
        }
        new
    }

    fn remove_node(&mut self, key: usize) {
        let node = self.nodes.remove(key);
        match node.prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next.expect("removing the only suballocation"),
        }
        match node.next {
            Some(n) => self.nodes[n].prev = node.prev,
            None => self.tail = node.prev.expect("removing the only suballocation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::block::DeviceBlock,
        crate::config::FRAME_INDEX_LOST,
        core::sync::atomic::Ordering,
    };

    const BLOCK_SIZE: u64 = 1024 * 1024;

    fn context(
        size: u64,
        alignment: u64,
        granularity: u64,
        kind: SuballocationType,
    ) -> RequestContext {
        RequestContext {
            size,
            alignment,
            granularity,
            kind,
            strategy: PlacementStrategy::BestFit,
            current_frame: 0,
            frame_in_use_count: 0,
            can_make_other_lost: false,
        }
    }

    fn alloc(
        meta: &mut BlockMetadata<()>,
        block: &Arc<DeviceBlock<()>>,
        ctx: &RequestContext,
    ) -> Arc<AllocationInner<()>> {
        let request = meta.try_request(ctx).expect("placement must succeed");
        let inner = Arc::new(AllocationInner::block_backed(
            ctx.size,
            ctx.alignment,
            ctx.kind,
            0,
            false,
            false,
            ctx.current_frame,
            0,
            0,
            block.clone(),
            request.offset,
        ));
        meta.commit(request, ctx.kind, ctx.size, inner.clone());
        inner
    }

    fn lost_alloc(
        meta: &mut BlockMetadata<()>,
        block: &Arc<DeviceBlock<()>>,
        ctx: &RequestContext,
        last_use_frame: u32,
    ) -> Arc<AllocationInner<()>> {
        let request = meta.try_request(ctx).expect("placement must succeed");
        let inner = Arc::new(AllocationInner::block_backed(
            ctx.size,
            ctx.alignment,
            ctx.kind,
            0,
            true,
            false,
            last_use_frame,
            0,
            0,
            block.clone(),
            request.offset,
        ));
        meta.commit(request, ctx.kind, ctx.size, inner.clone());
        inner
    }

    fn block() -> Arc<DeviceBlock<()>> {
        Arc::new(DeviceBlock::new((), BLOCK_SIZE, 0, 0))
    }

    #[test]
    fn basic_placement_reuses_freed_front() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(256 * 1024, 64, 64, SuballocationType::Buffer);
        let a = alloc(&mut meta, &block, &ctx);
        assert_eq!(a.offset_raw(), 0);

        let b = alloc(&mut meta, &block, &ctx);
        assert_eq!(b.offset_raw(), 262144);

        meta.free(&a);
        assert!(meta.validate());

        let ctx = context(128 * 1024, 64, 64, SuballocationType::Buffer);
        let c = alloc(&mut meta, &block, &ctx);
        assert_eq!(c.offset_raw(), 0);
    }

    #[test]
    fn image_after_buffer_bumps_to_next_page() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(600, 1, 1024, SuballocationType::Buffer);
        let a = alloc(&mut meta, &block, &ctx);
        assert_eq!(a.offset_raw(), 0);

        let ctx = context(600, 1, 1024, SuballocationType::ImageOptimal);
        let b = alloc(&mut meta, &block, &ctx);
        assert_eq!(b.offset_raw(), 1024);
    }

    #[test]
    fn conflicting_forward_neighbour_is_refused() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        // Two buffers on the first page, then free the front one.
        let ctx = context(600, 1, 1024, SuballocationType::Buffer);
        let b1 = alloc(&mut meta, &block, &ctx);
        let _b2 = alloc(&mut meta, &block, &ctx);
        meta.free(&b1);

        // An optimal image cannot take the front hole because the second
        // buffer starts on the same page; it lands past the buffer instead,
        // bumped to the next page boundary.
        let ctx = context(600, 1, 1024, SuballocationType::ImageOptimal);
        let request = meta.try_request(&ctx).unwrap();
        assert_eq!(request.offset, 2048);

        // Another buffer is happy to reuse the hole.
        let ctx = context(600, 1, 1024, SuballocationType::Buffer);
        assert_eq!(meta.try_request(&ctx).unwrap().offset, 0);
    }

    #[test]
    fn freeing_coalesces_neighbours() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(64 * 1024, 1, 1, SuballocationType::Buffer);
        let a = alloc(&mut meta, &block, &ctx);
        let b = alloc(&mut meta, &block, &ctx);
        let c = alloc(&mut meta, &block, &ctx);
        assert_eq!(a.offset_raw(), 0);
        assert_eq!(b.offset_raw(), 65536);
        assert_eq!(c.offset_raw(), 131072);

        meta.free(&b);
        meta.free(&a);

        // One free range covering the first two slots, one covering the
        // tail after the third allocation.
        assert_eq!(meta.free_count, 2);
        assert_eq!(meta.sum_free, BLOCK_SIZE - 64 * 1024);

        let front = &meta.nodes[meta.head].suballoc;
        assert_eq!(front.kind, SuballocationType::Free);
        assert_eq!((front.offset, front.size), (0, 131072));

        let tail = &meta.nodes[meta.tail].suballoc;
        assert_eq!(tail.kind, SuballocationType::Free);
        assert_eq!((tail.offset, tail.size), (196608, BLOCK_SIZE - 196608));

        meta.free(&c);
        assert!(meta.is_empty());
    }

    #[test]
    fn fills_block_exactly() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(BLOCK_SIZE / 16, 256, 1, SuballocationType::Buffer);
        let mut live = Vec::new();
        for i in 0..16 {
            let inner = alloc(&mut meta, &block, &ctx);
            assert_eq!(inner.offset_raw(), i * BLOCK_SIZE / 16);
            live.push(inner);
        }
        assert_eq!(meta.sum_free(), 0);
        assert!(meta.try_request(&context(1, 1, 1, SuballocationType::Buffer)).is_none());

        for inner in &live {
            meta.free(inner);
        }
        assert!(meta.is_empty());
    }

    #[test]
    fn best_fit_picks_smallest_range() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        // Carve out A B C D and free B and D, leaving two free ranges of
        // different sizes (D's tail range is larger).
        let ctx = context(128 * 1024, 1, 1, SuballocationType::Buffer);
        let _a = alloc(&mut meta, &block, &ctx);
        let b = alloc(&mut meta, &block, &ctx);
        let _c = alloc(&mut meta, &block, &ctx);
        let d = alloc(&mut meta, &block, &ctx);
        meta.free(&d);
        meta.free(&b);

        // Best fit lands in B's hole, not the bigger tail.
        let ctx = context(64 * 1024, 1, 1, SuballocationType::Buffer);
        let request = meta.try_request(&ctx).unwrap();
        assert_eq!(request.offset, 128 * 1024);

        // Worst fit prefers the big tail range.
        let ctx = RequestContext {
            strategy: PlacementStrategy::WorstFit,
            ..ctx
        };
        let request = meta.try_request(&ctx).unwrap();
        assert_eq!(request.offset, 3 * 128 * 1024);

        // Min offset walks from the front.
        let ctx = RequestContext {
            strategy: PlacementStrategy::MinOffset,
            ..ctx
        };
        let request = meta.try_request(&ctx).unwrap();
        assert_eq!(request.offset, 128 * 1024);
    }

    #[test]
    fn alignment_padding_is_returned_as_free_range() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(100, 1, 1, SuballocationType::Buffer);
        let _a = alloc(&mut meta, &block, &ctx);

        let ctx = context(256, 4096, 1, SuballocationType::Buffer);
        let b = alloc(&mut meta, &block, &ctx);
        assert_eq!(b.offset_raw(), 4096);

        // [100, 4096) must have been split off as a free range.
        assert_eq!(meta.free_count, 2);
        assert_eq!(meta.sum_free, BLOCK_SIZE - 100 - 256);
        assert!(meta.validate());
    }

    #[test]
    fn losing_sweep_reclaims_stale_allocations() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        // Two allocations filling the whole block, last used at frames 3
        // and 4, protected for 2 frames.
        let ctx = context(BLOCK_SIZE / 2, 1, 1, SuballocationType::Buffer);
        let x = lost_alloc(&mut meta, &block, &ctx, 3);
        let y = lost_alloc(&mut meta, &block, &ctx, 4);
        assert_eq!(meta.sum_free(), 0);

        let ctx = RequestContext {
            size: BLOCK_SIZE,
            current_frame: 10,
            frame_in_use_count: 2,
            can_make_other_lost: true,
            ..ctx
        };
        let mut request = meta.try_request(&ctx).expect("reclaimable span expected");
        assert_eq!(request.offset, 0);
        assert_eq!(request.items_to_make_lost, 2);
        assert_eq!(request.sum_item_size, BLOCK_SIZE);

        let reclaimed = meta
            .make_requested_lost(&mut request, 10, 2)
            .expect("no target was revived");
        assert_eq!(reclaimed, BLOCK_SIZE);
        assert_eq!(x.last_use_frame.load(Ordering::Acquire), FRAME_INDEX_LOST);
        assert_eq!(y.last_use_frame.load(Ordering::Acquire), FRAME_INDEX_LOST);
        assert!(meta.is_empty());

        let z = Arc::new(AllocationInner::block_backed(
            BLOCK_SIZE,
            1,
            SuballocationType::Buffer,
            0,
            false,
            false,
            10,
            0,
            0,
            block.clone(),
            request.offset,
        ));
        meta.commit(request, SuballocationType::Buffer, BLOCK_SIZE, z);
        assert_eq!(meta.sum_free(), 0);
    }

    #[test]
    fn losing_sweep_respects_frames_in_use() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(BLOCK_SIZE / 2, 1, 1, SuballocationType::Buffer);
        let _x = lost_alloc(&mut meta, &block, &ctx, 3);
        let _y = lost_alloc(&mut meta, &block, &ctx, 9);

        // Y was used at frame 9 and is protected through frame 11.
        let ctx = RequestContext {
            size: BLOCK_SIZE,
            current_frame: 10,
            frame_in_use_count: 2,
            can_make_other_lost: true,
            ..ctx
        };
        assert!(meta.try_request(&ctx).is_none());
    }

    #[test]
    fn revived_target_aborts_sweep() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(BLOCK_SIZE, 1, 1, SuballocationType::Buffer);
        let x = lost_alloc(&mut meta, &block, &ctx, 3);

        let ctx = RequestContext {
            current_frame: 10,
            frame_in_use_count: 2,
            can_make_other_lost: true,
            ..ctx
        };
        let mut request = meta.try_request(&ctx).expect("stale target expected");

        // The owner is touched again before the sweep runs.
        assert!(x.touch(10));
        assert!(meta.make_requested_lost(&mut request, 10, 2).is_none());
        assert_eq!(meta.sum_free(), 0);
    }

    #[test]
    fn small_free_ranges_stay_out_of_the_index() {
        let block = block();
        let mut meta = BlockMetadata::new(BLOCK_SIZE);

        let ctx = context(100, 1, 1, SuballocationType::Buffer);
        let a = alloc(&mut meta, &block, &ctx);
        let b = alloc(&mut meta, &block, &ctx);
        let _c = alloc(&mut meta, &block, &ctx);

        // An 8-byte hole right behind the head.
        meta.free(&a);
        let ctx = context(92, 1, 1, SuballocationType::Buffer);
        let _a2 = alloc(&mut meta, &block, &ctx);

        assert_eq!(meta.free_count, 2);
        assert_eq!(meta.free_index.len(), 1);
        assert!(meta.validate());

        // Freeing the neighbour merges the hole back into a registered
        // range.
        meta.free(&b);
        assert_eq!(meta.free_count, 2);
        assert_eq!(meta.free_index.len(), 2);
        assert!(meta.validate());
    }
}
