mod common;

use std::thread;

use common::Harness;
use pretty_assertions::assert_eq;
use pva_kmd::KmdError;
use pva_protocol::{PvaCmdWriter, ResourceAccess};

const THREADS: usize = 4;

#[test]
fn concurrent_submissions_get_distinct_post_fences() {
    const PER_THREAD: u32 = 5;
    let h = Harness::new();
    let ctx = h.context();
    let res = ctx.resources().unwrap();
    let submitter = res.submitter();
    let start = submitter.post_fence_value();
    let mut noop = PvaCmdWriter::new();
    noop.noop();
    let noop = noop.as_bytes();

    let mut values: Vec<u32> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    (0..PER_THREAD)
                        .map(|_| {
                            let value = submitter.submit_cmds(noop).unwrap();
                            submitter.wait(value).unwrap();
                            value
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });
    values.sort_unstable();
    let total = THREADS as u32 * PER_THREAD;
    assert_eq!(values, (start + 1..=start + total).collect::<Vec<_>>());
    assert_eq!(submitter.post_fence_value(), start + total);

    // Every chain was signalled, so none of the pool may stay allocated.
    let pool = submitter.chunk_pool();
    pool.reclaim_completed();
    assert_eq!(pool.num_free(), pool.num_chunks());
}

#[test]
fn concurrent_registrations_get_distinct_ids() {
    const PER_THREAD: usize = 3;
    let h = Harness::new();
    let ctx = h.context();
    let res = ctx.resources().unwrap();
    let table = res.resource_table();
    let live_resources = table.live_count();
    let live_allocations = h.live_allocations();

    let buffers: Vec<Vec<_>> = (0..THREADS)
        .map(|_| (0..PER_THREAD).map(|_| h.alloc(0x1000, &ctx)).collect())
        .collect();
    let mut ids: Vec<u32> = thread::scope(|s| {
        let workers: Vec<_> = buffers
            .into_iter()
            .map(|mems| {
                s.spawn(move || {
                    mems.into_iter()
                        .map(|mem| {
                            table
                                .add_dram_buffer_resource(mem, ResourceAccess::READ)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), THREADS * PER_THREAD);
    assert_eq!(
        table.live_count(),
        live_resources + (THREADS * PER_THREAD) as u32
    );

    thread::scope(|s| {
        for chunk in ids.chunks(PER_THREAD) {
            s.spawn(move || chunk.iter().for_each(|&id| table.drop_resource(id)));
        }
    });
    assert_eq!(table.live_count(), live_resources);
    assert_eq!(h.live_allocations(), live_allocations);
}

#[test]
fn racing_unregisters_release_the_buffer_once() {
    let h = Harness::new();
    let ctx = h.context();
    let res = ctx.resources().unwrap();
    let live_resources = res.resource_table().live_count();

    for _ in 0..8 {
        let id = ctx
            .register_memory(h.alloc(0x1000, &ctx), ResourceAccess::READ)
            .unwrap();
        let results: Vec<_> = thread::scope(|s| {
            let racers: Vec<_> = (0..2)
                .map(|_| s.spawn(|| ctx.unregister_memory(id)))
                .collect();
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(()) | Err(KmdError::Inval(_)))));
        assert_eq!(res.resource_table().live_count(), live_resources);
        assert!(res.resource_table().use_resource(id).is_none());
    }
}
