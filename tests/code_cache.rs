use cafe_core::jit::{Claim, CodeBlockIndex, CodeCache, NoUnwindRegistry, UnwindRegistry};
use cafe_core::{CodeCacheConfig, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 8;

fn cache() -> CodeCache {
    CodeCache::with_unwind_registry(&CodeCacheConfig::small(), Box::new(NoUnwindRegistry)).unwrap()
}

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicUsize,
    cleared: AtomicUsize,
}

#[derive(Debug, Default)]
struct RecordingRegistry(Arc<Counters>);

impl UnwindRegistry for RecordingRegistry {
    unsafe fn register(&self, _code: *const u8, _code_size: usize, unwind: &[u8]) -> cafe_core::Result<()> {
        assert!(!unwind.is_empty());
        self.0.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn unregister(&self, _code: *const u8) {}

    fn unregister_all(&self) {
        self.0.cleared.fetch_add(1, Ordering::Relaxed);
    }
}

#[test_log::test]
fn racing_lookups_share_one_table() {
    let cache = cache();
    let barrier = Barrier::new(THREADS);

    let cells: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = &cache;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    // touch a neighbour first so every thread races on table creation
                    cache.get_index_pointer(0x0200_0000 + i as u32 * 4);
                    cache.get_index_pointer(0x0200_0000).as_ptr() as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(cells.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(cache.get_index_pointer(0x0200_0000).as_ptr() as usize, cells[0]);
}

#[test_log::test]
fn exactly_one_thread_wins_a_claim() {
    let cache = cache();
    let barrier = Barrier::new(THREADS);
    let won = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                if cache.try_claim(0x0210_0040) == Claim::Won {
                    won.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(won.load(Ordering::Relaxed), 1);
    assert_eq!(cache.get_index(0x0210_0040), CodeBlockIndex::COMPILING);
}

#[test_log::test]
fn racing_compilers_publish_one_block() {
    let cache = cache();
    let barrier = Barrier::new(THREADS);
    let address = 0x0220_0100;

    let seen: Vec<CodeBlockIndex> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let cache = &cache;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    loop {
                        match cache.try_claim(address) {
                            Claim::Won => {
                                let index = cache
                                    .register_code_block(address, &[0x90, 0x90, 0xC3], &[])
                                    .unwrap();
                                cache.set_block_index(address, index);
                                return index;
                            }
                            Claim::Compiled(index) => return index,
                            Claim::InFlight => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(seen.iter().all(|index| *index == seen[0]));
    assert_eq!(cache.statistics().blocks, 1);
    assert_eq!(cache.lookup(address).unwrap().code(), &[0x90, 0x90, 0xC3]);
}

#[test_log::test]
fn code_space_fits_exactly() {
    let config = CodeCacheConfig::small();
    let cache = cache();
    let everything = vec![0xCC; config.code_reserve];
    cache.register_code_block(0x0200_0000, &everything, &[]).unwrap();
    assert_eq!(
        cache.register_code_block(0x0200_0004, &[0xC3], &[]).unwrap_err(),
        Error::OutOfMemory
    );

    let cache = self::cache();
    let too_much = vec![0xCC; config.code_reserve + 1];
    assert_eq!(
        cache.register_code_block(0x0200_0000, &too_much, &[]).unwrap_err(),
        Error::OutOfMemory
    );
    let stats = cache.statistics();
    assert_eq!(stats.code_allocated, 0);
    assert_eq!(stats.blocks, 0);

    // the failed request left the allocator usable
    cache.register_code_block(0x0200_0000, &[0xC3], &[]).unwrap();
}

#[test_log::test]
fn block_table_fills_up() {
    let config = CodeCacheConfig {
        max_blocks: 2,
        ..CodeCacheConfig::small()
    };
    let cache = CodeCache::with_unwind_registry(&config, Box::new(NoUnwindRegistry)).unwrap();
    cache.register_code_block(0x0200_0000, &[0xC3], &[]).unwrap();
    cache.register_code_block(0x0200_0004, &[0xC3], &[]).unwrap();
    assert_eq!(
        cache.register_code_block(0x0200_0008, &[0xC3], &[]).unwrap_err(),
        Error::OutOfMemory
    );
}

#[test_log::test]
fn invalidation_spans_leaf_tables() {
    let cache = cache();
    let publish = |address: u32| {
        let index = cache.register_code_block(address, &[0xC3], &[]).unwrap();
        cache.set_block_index(address, index);
        index
    };

    let kept = publish(0x0200_0000);
    publish(0x0200_0010);
    publish(0x0201_0000);
    assert_eq!(cache.try_claim(0x0200_0020), Claim::Won);

    cache.invalidate(0x0200_0010, 0x1_0000);

    assert_eq!(cache.get_index(0x0200_0000), kept);
    assert_eq!(cache.get_index(0x0200_0010), CodeBlockIndex::UNCOMPILED);
    assert_eq!(cache.get_index(0x0201_0000), CodeBlockIndex::UNCOMPILED);
    // an in-flight compile is not disturbed
    assert_eq!(cache.get_index(0x0200_0020), CodeBlockIndex::COMPILING);

    // invalidated blocks stay allocated until the cache is cleared
    assert_eq!(cache.statistics().blocks, 3);
    assert_eq!(cache.blocks().count(), 3);

    // ranges over tables that were never allocated are fine
    cache.invalidate(0x8000_0000, 0x10_0000);
    cache.invalidate(0xFFFF_FFF0, 0x100);
}

#[test_log::test]
fn unwind_info_follows_the_cache_lifecycle() {
    let counters = Arc::new(Counters::default());
    let mut cache = CodeCache::with_unwind_registry(
        &CodeCacheConfig::small(),
        Box::new(RecordingRegistry(counters.clone())),
    )
    .unwrap();

    let index = cache
        .register_code_block(0x0200_0000, &[0xC3], &[0x14, 0, 0, 0])
        .unwrap();
    cache.register_code_block(0x0200_0004, &[0xC3], &[]).unwrap();
    assert_eq!(counters.registered.load(Ordering::Relaxed), 1);

    let block = cache.get_block_by_index(index).unwrap();
    assert_eq!(block.unwind_info(), &[0x14, 0, 0, 0]);
    assert_eq!(block.unwind_info().as_ptr() as usize % 8, 0);

    cache.clear();
    assert_eq!(counters.cleared.load(Ordering::Relaxed), 1);
    drop(cache);
    assert_eq!(counters.cleared.load(Ordering::Relaxed), 2);
}

#[cfg(unix)]
#[test_log::test]
fn host_unwinder_tolerates_bad_unwind_info() {
    let cache = CodeCache::new(&CodeCacheConfig::small()).unwrap();
    // a section holding nothing but a terminator
    let index = cache
        .register_code_block(0x0200_0000, &[0xC3], &[0, 0, 0, 0])
        .unwrap();
    cache.set_block_index(0x0200_0000, index);
    // truncated 64-bit length
    cache
        .register_code_block(0x0200_0004, &[0xC3], &[0xFF, 0xFF, 0xFF, 0xFF])
        .unwrap();

    assert!(cache.lookup(0x0200_0000).is_some());
}

#[test_log::test]
fn execution_statistics_accumulate() {
    let cache = cache();
    let index = cache.register_code_block(0x0200_0000, &[0xC3], &[]).unwrap();
    let block = cache.get_block_by_index(index).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    block.record_execution(Duration::from_micros(1));
                }
            });
        }
    });

    assert_eq!(block.executions(), 400);
    assert_eq!(block.total_time(), Duration::from_micros(400));
}
