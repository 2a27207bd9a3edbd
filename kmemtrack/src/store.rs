//! # Aggregation Store
//!
//! The stateful core: matches frees to earlier allocations by address and
//! keeps live and peak usage per task, per domain, per call stack.
//!
//! ## Data Model
//!
//! ```text
//! tasks: TaskId ──► TaskEntry { name }
//!                      └─► Domain ──► DomainNode { totals, misses }
//!                                        └─► CallStack ──► Stats
//!
//! open:  (Domain, address) ──► OpenAllocation { task, size, call stack }
//! ```
//!
//! Page frame numbers and slab pointers live in different keyspaces, so the
//! open map is keyed by domain as well as address.
//!
//! ## Reconciliation
//!
//! - **Free, found**: the originating stack (not the freeing task) is credited
//! - **Free, not found**: a miss on the freeing task's domain node; no
//!   [`Stats`] change
//! - **Alloc on an address still open**: the stale entry is closed as an
//!   implicit free before the new allocation is recorded
//!
//! # Performance
//!
//! - `record()`: O(1) amortized (HashMap lookups, stack resolution is cached)
//! - `snapshot()`: O(tasks × stacks), plus sorting for a deterministic order

use serde::Serialize;
use std::collections::HashMap;

use crate::domain::{AllocEvent, CallStack, Domain, EventKind, TaskId};
use crate::resolver::Resolver;

// =============================================================================
// STATISTICS
// =============================================================================

/// Usage counters for one bucket (call stack, task/domain, or whole domain)
///
/// `bytes_peak >= bytes_current` at all times; every field except
/// `bytes_current` only grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub bytes_current: u64,
    pub bytes_peak: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    /// Allocations closed because their address was handed out again
    pub implicit_frees: u64,
}

impl Stats {
    fn on_alloc(&mut self, size: u64) {
        self.bytes_current = self.bytes_current.saturating_add(size);
        self.bytes_peak = self.bytes_peak.max(self.bytes_current);
        self.alloc_count += 1;
    }

    fn on_free(&mut self, size: u64) {
        self.bytes_current = self.bytes_current.saturating_sub(size);
        self.free_count += 1;
    }

    fn on_implicit_free(&mut self, size: u64) {
        self.bytes_current = self.bytes_current.saturating_sub(size);
        self.implicit_frees += 1;
    }
}

/// Process-wide counters for one domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DomainTotals {
    /// Usage summed over every task and stack
    pub stats: Stats,
    /// Frees whose address was never seen allocated
    pub unmatched_frees: u64,
    /// Allocations still waiting for their free
    pub open_allocations: u64,
}

/// A live allocation waiting for its free
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAllocation {
    pub task_id: TaskId,
    pub size: u64,
    pub call_stack: CallStack,
}

// =============================================================================
// TASK TREE
// =============================================================================

#[derive(Debug, Default)]
struct DomainNode {
    stacks: HashMap<CallStack, Stats>,
    /// Usage of this task in this domain across all stacks
    totals: Stats,
    /// Unmatched frees issued by this task
    misses: u64,
}

#[derive(Debug)]
struct TaskEntry {
    name: String,
    domains: [Option<DomainNode>; 2],
}

impl TaskEntry {
    fn node_mut(&mut self, domain: Domain) -> &mut DomainNode {
        self.domains[domain.index()].get_or_insert_with(DomainNode::default)
    }
}

// =============================================================================
// SNAPSHOT (OUTPUT TYPE)
// =============================================================================

/// Owned, immutable copy of the store handed to the reporter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Sorted by task id
    pub tasks: Vec<TaskSnapshot>,
    /// Indexed by [`Domain::index`]
    pub totals: [DomainTotals; 2],
}

impl Snapshot {
    #[must_use]
    pub fn totals(&self, domain: Domain) -> &DomainTotals {
        &self.totals[domain.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub name: String,
    /// Only domains the task touched, in [`Domain::ALL`] order
    pub domains: Vec<DomainSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSnapshot {
    pub domain: Domain,
    pub totals: Stats,
    pub misses: u64,
    /// Sorted by call stack
    pub stacks: Vec<(CallStack, Stats)>,
}

// =============================================================================
// AGGREGATION STORE
// =============================================================================

pub struct AggregationStore<R: Resolver> {
    resolver: R,
    tasks: HashMap<TaskId, TaskEntry>,
    open: HashMap<(Domain, u64), OpenAllocation>,
    totals: [DomainTotals; 2],
}

impl<R: Resolver> AggregationStore<R> {
    #[must_use]
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            tasks: HashMap::new(),
            open: HashMap::new(),
            totals: [DomainTotals::default(); 2],
        }
    }

    /// Apply one event. Never fails: anomalies become counters.
    pub fn record(&mut self, event: AllocEvent) {
        let AllocEvent { task_id, comm, domain, kind, address, raw_frames } = event;
        self.ensure_task(task_id, comm);

        match kind {
            EventKind::Alloc { size } => {
                let call_stack = self.resolver.resolve_stack(&raw_frames, task_id);

                if let Some(stale) = self.open.remove(&(domain, address)) {
                    self.release(domain, &stale, true);
                }

                let totals = &mut self.totals[domain.index()];
                totals.stats.on_alloc(size);
                totals.open_allocations += 1;

                if let Some(task) = self.tasks.get_mut(&task_id) {
                    let node = task.node_mut(domain);
                    node.totals.on_alloc(size);
                    node.stacks.entry(call_stack.clone()).or_default().on_alloc(size);
                }

                self.open.insert((domain, address), OpenAllocation { task_id, size, call_stack });
            }
            EventKind::Free => match self.open.remove(&(domain, address)) {
                Some(allocation) => self.release(domain, &allocation, false),
                None => {
                    self.totals[domain.index()].unmatched_frees += 1;
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.node_mut(domain).misses += 1;
                    }
                }
            },
        }
    }

    /// Credit a closed allocation back to the stack that made it
    fn release(&mut self, domain: Domain, allocation: &OpenAllocation, implicit: bool) {
        let apply = |stats: &mut Stats| {
            if implicit {
                stats.on_implicit_free(allocation.size);
            } else {
                stats.on_free(allocation.size);
            }
        };

        let totals = &mut self.totals[domain.index()];
        apply(&mut totals.stats);
        totals.open_allocations = totals.open_allocations.saturating_sub(1);

        if let Some(task) = self.tasks.get_mut(&allocation.task_id) {
            let node = task.node_mut(domain);
            apply(&mut node.totals);
            if let Some(stats) = node.stacks.get_mut(&allocation.call_stack) {
                apply(stats);
            }
        }
    }

    fn ensure_task(&mut self, task_id: TaskId, comm: Option<String>) {
        if self.tasks.contains_key(&task_id) {
            return;
        }
        let name = comm.unwrap_or_else(|| self.resolver.resolve_task_name(task_id));
        self.tasks.insert(task_id, TaskEntry { name, domains: [None, None] });
    }

    /// Number of allocations still waiting for their free
    #[must_use]
    pub fn open_allocations(&self) -> usize {
        self.open.len()
    }

    /// Look up a live allocation
    #[must_use]
    pub fn open_allocation(&self, domain: Domain, address: u64) -> Option<&OpenAllocation> {
        self.open.get(&(domain, address))
    }

    #[must_use]
    pub fn totals(&self, domain: Domain) -> DomainTotals {
        self.totals[domain.index()]
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Owned copy of the whole tree, in deterministic order
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut tasks: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .map(|(task_id, entry)| TaskSnapshot {
                task_id: *task_id,
                name: entry.name.clone(),
                domains: Domain::ALL
                    .iter()
                    .filter_map(|domain| {
                        let node = entry.domains[domain.index()].as_ref()?;
                        let mut stacks: Vec<(CallStack, Stats)> =
                            node.stacks.iter().map(|(s, stats)| (s.clone(), *stats)).collect();
                        stacks.sort_by(|a, b| a.0.cmp(&b.0));
                        Some(DomainSnapshot {
                            domain: *domain,
                            totals: node.totals,
                            misses: node.misses,
                            stacks,
                        })
                    })
                    .collect(),
            })
            .collect();
        tasks.sort_by_key(|t| t.task_id);

        Snapshot { tasks, totals: self.totals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawFrames;

    /// Resolver that uses symbol frames as-is
    struct PlainResolver;

    impl Resolver for PlainResolver {
        fn resolve_stack(&self, frames: &RawFrames, _task_id: TaskId) -> CallStack {
            match frames {
                RawFrames::Symbols(symbols) => CallStack::new(symbols.clone()),
                RawFrames::Addresses(addresses) => {
                    CallStack::new(addresses.iter().map(|a| format!("{a:#x}")).collect())
                }
            }
        }

        fn resolve_task_name(&self, task_id: TaskId) -> String {
            format!("task-{}", task_id.0)
        }
    }

    fn alloc(task: u32, address: u64, size: u64, stack: &str) -> AllocEvent {
        AllocEvent::alloc(TaskId(task), Domain::Slab, address, size)
            .with_frames(RawFrames::Symbols(vec![stack.to_string()]))
    }

    fn free(task: u32, address: u64) -> AllocEvent {
        AllocEvent::free(TaskId(task), Domain::Slab, address)
    }

    fn stack_stats(snapshot: &Snapshot, task: u32, stack: &str) -> Stats {
        let task = snapshot.tasks.iter().find(|t| t.task_id == TaskId(task)).unwrap();
        task.domains[0]
            .stacks
            .iter()
            .find(|(s, _)| s.frames()[0] == stack)
            .map(|(_, stats)| *stats)
            .unwrap()
    }

    #[test]
    fn test_free_credits_originating_stack() {
        let mut store = AggregationStore::new(PlainResolver);
        store.record(alloc(1, 0xa000, 64, "f"));
        store.record(free(2, 0xa000));

        let snapshot = store.snapshot();
        let stats = stack_stats(&snapshot, 1, "f");
        assert_eq!(stats.bytes_current, 0);
        assert_eq!(stats.bytes_peak, 64);
        assert_eq!(stats.free_count, 1);

        // The freeing task exists but owns no usage
        let freer = snapshot.tasks.iter().find(|t| t.task_id == TaskId(2)).unwrap();
        assert_eq!(freer.name, "task-2");
        assert!(freer.domains.is_empty());
    }

    #[test]
    fn test_address_reuse_is_implicit_free() {
        let mut store = AggregationStore::new(PlainResolver);
        store.record(alloc(1, 0xa000, 64, "f"));
        store.record(alloc(1, 0xa000, 32, "g"));

        let snapshot = store.snapshot();
        let f = stack_stats(&snapshot, 1, "f");
        assert_eq!(f.bytes_current, 0);
        assert_eq!(f.implicit_frees, 1);
        assert_eq!(f.free_count, 0);
        assert_eq!(stack_stats(&snapshot, 1, "g").bytes_current, 32);
        assert_eq!(snapshot.totals(Domain::Slab).stats.implicit_frees, 1);
        assert_eq!(store.open_allocations(), 1);
        assert_eq!(store.open_allocation(Domain::Slab, 0xa000).unwrap().size, 32);
    }

    #[test]
    fn test_domains_do_not_alias() {
        let mut store = AggregationStore::new(PlainResolver);
        store.record(AllocEvent::alloc(TaskId(1), Domain::Page, 0x10, 4096));
        store.record(free(1, 0x10));

        assert_eq!(store.open_allocations(), 1);
        assert_eq!(store.totals(Domain::Slab).unmatched_frees, 1);
        assert_eq!(store.totals(Domain::Page).stats.bytes_current, 4096);
        assert_eq!(store.totals(Domain::Page).open_allocations, 1);
    }

    #[test]
    fn test_comm_hint_names_task() {
        let mut store = AggregationStore::new(PlainResolver);
        store.record(alloc(5, 0x1, 8, "f").with_comm("kswapd0"));
        store.record(alloc(5, 0x2, 8, "f").with_comm("renamed"));
        store.record(alloc(6, 0x3, 8, "f"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.tasks[0].name, "kswapd0");
        assert_eq!(snapshot.tasks[1].name, "task-6");
        assert_eq!(store.task_count(), 2);
    }

    #[test]
    fn test_task_domain_totals_track_peak() {
        let mut store = AggregationStore::new(PlainResolver);
        store.record(alloc(1, 0x1, 100, "f"));
        store.record(alloc(1, 0x2, 50, "g"));
        store.record(free(1, 0x1));
        store.record(alloc(1, 0x3, 20, "f"));

        let snapshot = store.snapshot();
        let node = &snapshot.tasks[0].domains[0];
        assert_eq!(node.totals.bytes_current, 70);
        assert_eq!(node.totals.bytes_peak, 150);
        assert_eq!(node.totals.alloc_count, 3);
        assert_eq!(node.stacks.len(), 2);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut store = AggregationStore::new(PlainResolver);
        store.record(alloc(1, 0x1, 100, "f"));
        let before = store.snapshot();
        store.record(free(1, 0x1));
        assert_eq!(stack_stats(&before, 1, "f").bytes_current, 100);
        assert_ne!(before, store.snapshot());
    }
}
