use kmemtrack::domain::{AllocEvent, CallStack, Domain, RawFrames, TaskId};
use kmemtrack::resolver::{KernelResolver, KernelSymbols};
use kmemtrack::store::{AggregationStore, Stats};

fn store() -> (tempfile::TempDir, AggregationStore<KernelResolver>) {
    // Empty proc root: every task name falls back to "[pid N]"
    let proc_root = tempfile::tempdir().unwrap();
    let resolver = KernelResolver::with_proc_root(KernelSymbols::default(), proc_root.path());
    (proc_root, AggregationStore::new(resolver))
}

fn page_alloc(task: u32, pfn: u64, size: u64, frame: &str) -> AllocEvent {
    AllocEvent::alloc(TaskId(task), Domain::Page, pfn, size)
        .with_frames(RawFrames::Symbols(vec![frame.to_string()]))
}

fn page_stats(store: &AggregationStore<KernelResolver>, task: u32) -> Stats {
    let snapshot = store.snapshot();
    let task = snapshot.tasks.iter().find(|t| t.task_id == TaskId(task)).expect("task exists");
    task.domains.iter().find(|d| d.domain == Domain::Page).expect("page node").totals
}

#[test]
fn test_two_allocs_one_free() {
    let (_proc, mut store) = store();
    store.record(page_alloc(1, 0x1000, 4096, "alloc_pages"));
    store.record(page_alloc(1, 0x2000, 4096, "alloc_pages"));
    store.record(AllocEvent::free(TaskId(1), Domain::Page, 0x1000));

    let stats = page_stats(&store, 1);
    assert_eq!(stats.bytes_current, 4096);
    assert_eq!(stats.bytes_peak, 8192);
    assert_eq!(stats.alloc_count, 2);
    assert_eq!(stats.free_count, 1);
    assert!(store.open_allocation(Domain::Page, 0x1000).is_none());
    assert!(store.open_allocation(Domain::Page, 0x2000).is_some());

    // Both allocations share one call stack, so one bucket carries it all
    let snapshot = store.snapshot();
    let task = snapshot.tasks.iter().find(|t| t.task_id == TaskId(1)).unwrap();
    let page = task.domains.iter().find(|d| d.domain == Domain::Page).unwrap();
    assert_eq!(page.stacks.len(), 1);
    let (stack, bucket) = &page.stacks[0];
    assert_eq!(stack.frames(), ["alloc_pages"]);
    assert_eq!(bucket.bytes_current, 4096);
    assert_eq!(bucket.bytes_peak, 8192);
    assert_eq!(bucket.alloc_count, 2);
    assert_eq!(bucket.free_count, 1);
}

#[test]
fn test_free_of_unknown_address_is_a_miss() {
    let (_proc, mut store) = store();
    store.record(AllocEvent::free(TaskId(9), Domain::Slab, 0x9999));

    let totals = store.totals(Domain::Slab);
    assert_eq!(totals.unmatched_frees, 1);
    assert_eq!(totals.stats, Stats::default());

    let snapshot = store.snapshot();
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(snapshot.tasks[0].name, "[pid 9]");
    let node = &snapshot.tasks[0].domains[0];
    assert_eq!(node.misses, 1);
    assert_eq!(node.totals, Stats::default());
    assert!(node.stacks.is_empty());
}

#[test]
fn test_sum_of_sizes_without_frees() {
    let (_proc, mut store) = store();
    let sizes = [8_u64, 64, 4096, 192, 1];
    for (i, size) in sizes.iter().enumerate() {
        let event = AllocEvent::alloc(TaskId(3), Domain::Slab, 0x100 * (i as u64 + 1), *size);
        store.record(event);
    }

    let totals = store.totals(Domain::Slab);
    assert_eq!(totals.stats.bytes_current, sizes.iter().sum::<u64>());
    assert_eq!(totals.stats.bytes_peak, totals.stats.bytes_current);
    assert_eq!(totals.open_allocations, sizes.len() as u64);
}

#[test]
fn test_current_never_negative_for_any_interleaving() {
    let (_proc, mut store) = store();
    // Deterministic pseudo-random mix of allocs, frees, double frees and reuse
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    for _ in 0..2000 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let address = (state % 16) * 0x40;
        let task = u32::try_from(state % 3).unwrap();
        if state % 5 < 3 {
            store.record(AllocEvent::alloc(TaskId(task), Domain::Slab, address, (state % 512) + 1));
        } else {
            store.record(AllocEvent::free(TaskId(task), Domain::Slab, address));
        }

        let totals = store.totals(Domain::Slab);
        assert!(totals.stats.bytes_peak >= totals.stats.bytes_current);
        assert_eq!(totals.open_allocations, store.open_allocations() as u64);
    }

    for task in store.snapshot().tasks {
        for node in task.domains {
            assert!(node.totals.bytes_peak >= node.totals.bytes_current);
            for (_, stats) in node.stacks {
                assert!(stats.bytes_peak >= stats.bytes_current);
            }
        }
    }
}

#[test]
fn test_unresolved_addresses_become_hex_frames() {
    let (_proc, mut store) = store();
    store.record(
        AllocEvent::alloc(TaskId(1), Domain::Slab, 0xa0, 32)
            .with_frames(RawFrames::Addresses(vec![0xffff_ffff_8100_0000])),
    );
    store.record(AllocEvent::alloc(TaskId(1), Domain::Slab, 0xb0, 32));

    let open = store.open_allocation(Domain::Slab, 0xa0).unwrap();
    assert_eq!(open.call_stack.frames(), ["0xffffffff81000000"]);
    assert_eq!(store.open_allocation(Domain::Slab, 0xb0).unwrap().call_stack, CallStack::empty());
}
