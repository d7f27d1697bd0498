//! End-to-end behaviour of the cache stack through the public API

use assert_matches::assert_matches;
use edge_cache::cache::codec::entry_path;
use edge_cache::cache::entry::now_secs;
use edge_cache::cache::{
    BufferPool, BufferPoolConfig, IndexBackend, Item, ItemKind, KeyIndex, RangeSet,
    ShardedKeyIndex,
};
use edge_cache::{
    CacheConfig, CacheKey, CacheStack, Error, MemoryStorage, MemoryStorageConfig, ReadOptions,
    Storage, StorageKind, WriteOptions,
};
use std::fs::OpenOptions;
use std::sync::Arc;
use tempfile::TempDir;

const HEADER: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-type: video/mp2t\r\n\r\n";

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn disk_stack(dir: &TempDir, backend: IndexBackend) -> CacheStack {
    let mut config = CacheConfig::default();
    config.disk.dir = dir.path().to_path_buf();
    config.disk.purge_interval_secs = 0;
    config.disk.index.backend = backend;
    config.disk.index.shards = 4;
    let stack = CacheStack::new(config).unwrap();
    stack.start().unwrap();
    stack
}

fn write(stack: &CacheStack, key: &CacheKey, data: &[u8]) -> edge_cache::Result<()> {
    let opts = WriteOptions::new(now_secs() + 300, 200).with_body_size(data.len() as u64);
    let mut writer = stack.open_writer(key, opts)?;
    writer.write_header(HEADER)?;
    for chunk in data.chunks(4096) {
        writer.write(chunk)?;
    }
    writer.close()
}

#[test]
fn full_entry_reads_back_exactly() {
    let dir = TempDir::new().unwrap();
    let stack = disk_stack(&dir, IndexBackend::Sqlite);
    let key = CacheKey::new("https://cdn.example.com/video/seg-0001.ts");
    let data = body(300_000);
    write(&stack, &key, &data).unwrap();

    let mut reader = stack.open_reader(&key, ReadOptions::fresh()).unwrap();
    assert_eq!(reader.status(), 200);
    assert_eq!(reader.header_size(), HEADER.len() as u64);
    assert_eq!(reader.body_size(), data.len() as u64);
    assert_eq!(&reader.read_header().unwrap()[..], HEADER);
    assert_eq!(&reader.read_body().unwrap()[..], &data[..]);
}

#[test]
fn streaming_stops_early() {
    let dir = TempDir::new().unwrap();
    let stack = disk_stack(&dir, IndexBackend::Sqlite);
    let key = CacheKey::new("https://cdn.example.com/big.bin");
    let data = body(1_000_000);
    write(&stack, &key, &data).unwrap();

    let mut reader = stack.open_reader(&key, ReadOptions::fresh()).unwrap();
    let first = reader.body_chunks().unwrap().next().unwrap().unwrap();
    assert!(!first.is_empty());
    assert!(first.len() < data.len());
    assert_eq!(&first[..], &data[..first.len()]);

    let mut range = Vec::new();
    for chunk in reader.body_range_chunks(500_000, 500_099).unwrap() {
        range.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(&range[..], &data[500_000..500_100]);
}

#[test]
fn corrupted_entry_is_never_served() {
    let dir = TempDir::new().unwrap();
    let stack = disk_stack(&dir, IndexBackend::Sqlite);
    let key = CacheKey::new("https://cdn.example.com/corrupt");
    write(&stack, &key, &body(10_000)).unwrap();

    let path = entry_path(dir.path(), &key.hash);
    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 2)
        .unwrap();

    let err = stack.open_reader(&key, ReadOptions::fresh()).err().unwrap();
    assert!(err.is_not_found());
    assert!(!path.exists());
    assert!(!stack.disk().exist(&key));
}

#[test]
fn second_writer_sees_busy() {
    let dir = TempDir::new().unwrap();
    let stack = disk_stack(&dir, IndexBackend::Memory);
    let key = CacheKey::new("https://cdn.example.com/race");
    let opts = WriteOptions::new(now_secs() + 60, 200).with_body_size(3);

    let mut first = stack.open_writer(&key, opts).unwrap();
    let err = stack.open_writer(&key, opts).err().unwrap();
    assert_matches!(err, Error::Busy(_));
    assert!(err.is_ignorable());

    first.write(b"one").unwrap();
    first.close().unwrap();

    let mut second = stack.open_writer(&key, opts).unwrap();
    second.write(b"two").unwrap();
    second.close().unwrap();
    let mut reader = stack.open_reader(&key, ReadOptions::fresh()).unwrap();
    assert_eq!(&reader.read_body().unwrap()[..], b"two");
}

#[test]
fn concurrent_writers_never_interleave() {
    let dir = TempDir::new().unwrap();
    let stack = Arc::new(disk_stack(&dir, IndexBackend::Memory));
    let key = CacheKey::new("https://cdn.example.com/contended");

    let handles: Vec<_> = (0..8u8)
        .map(|id| {
            let stack = stack.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                let data = vec![id; 64 * 1024];
                match write(&stack, &key, &data) {
                    Ok(()) => true,
                    Err(e) => {
                        assert!(e.is_ignorable(), "unexpected error: {}", e);
                        false
                    }
                }
            })
        })
        .collect();
    let succeeded = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert!(succeeded >= 1);

    let mut reader = stack.open_reader(&key, ReadOptions::fresh()).unwrap();
    let read = reader.read_body().unwrap();
    assert_eq!(read.len(), 64 * 1024);
    assert!(read.iter().all(|b| *b == read[0]));
}

#[test]
fn partial_entry_assembles_across_sessions() {
    let dir = TempDir::new().unwrap();
    let stack = disk_stack(&dir, IndexBackend::Sqlite);
    let key = CacheKey::new("k");
    let data = body(200);

    for (first, last) in [(0usize, 99usize), (150, 199), (100, 149)] {
        let opts = WriteOptions::new(now_secs() + 300, 200)
            .with_body_size(200)
            .partial();
        let mut writer = stack.open_writer(&key, opts).unwrap();
        writer.write_header(HEADER).unwrap();
        writer.write_at(first as u64, &data[first..=last]).unwrap();
        writer.close().unwrap();

        if last == 199 {
            // a gap remains, so only partial reads may see the entry
            assert!(stack.open_reader(&key, ReadOptions::fresh()).is_err());
            let mut reader = stack
                .open_reader(&key, ReadOptions::fresh().partial())
                .unwrap();
            assert!(reader.body_range_chunks(0, 149).is_err());
            let mut tail = Vec::new();
            for chunk in reader.body_range_chunks(150, 199).unwrap() {
                tail.extend_from_slice(&chunk.unwrap());
            }
            assert_eq!(&tail[..], &data[150..]);
        }
    }

    let mut reader = stack.open_reader(&key, ReadOptions::fresh()).unwrap();
    assert_eq!(&reader.read_header().unwrap()[..], HEADER);
    assert_eq!(&reader.read_body().unwrap()[..], &data[..]);
}

#[test]
fn range_set_scenario_and_persistence() {
    let dir = TempDir::new().unwrap();
    let mut ranges = RangeSet::new(200);
    ranges.add(0, 99);
    ranges.add(150, 199);
    ranges.add(100, 149);
    assert!(ranges.contains(0, 199));
    assert_eq!(ranges.ranges(), vec![(0, 199)]);
    assert!(ranges.is_completed());

    let mut wide = RangeSet::new(0);
    wide.add(5, 9);
    wide.add(4_000_000_000, 10_000_000_000_000);
    let path = dir.path().join("wide.ranges");
    wide.save(&path).unwrap();
    let loaded = RangeSet::load(&path).unwrap();
    assert_eq!(loaded.ranges(), wide.ranges());
    assert_eq!(loaded.max(), 10_000_000_000_000);
}

#[test]
fn entries_survive_restart() {
    let dir = TempDir::new().unwrap();
    let key = CacheKey::new("https://cdn.example.com/persisted");
    let data = body(12_345);
    {
        let stack = disk_stack(&dir, IndexBackend::Sqlite);
        write(&stack, &key, &data).unwrap();
        stack.stop();
    }

    let stack = disk_stack(&dir, IndexBackend::Sqlite);
    let mut reader = stack.open_reader(&key, ReadOptions::fresh()).unwrap();
    assert_eq!(&reader.read_body().unwrap()[..], &data[..]);
    let stat = stack.stat().unwrap();
    assert_eq!(stat.tiers[0].index.count, 1);
    assert_eq!(stat.tiers[0].metrics.entry_count, 1);
}

#[test]
fn index_add_remove_on_both_backends() {
    let dir = TempDir::new().unwrap();
    let backends: Vec<Box<dyn KeyIndex>> = vec![
        Box::new(ShardedKeyIndex::in_memory(4)),
        Box::new(ShardedKeyIndex::open_sqlite(dir.path(), 4).unwrap()),
    ];
    for index in backends {
        index.init().unwrap();
        while !index.warm_up(100).unwrap() {}

        let mut hashes = Vec::new();
        for i in 0..10 {
            let key = CacheKey::new(format!("https://example.com/{}", i));
            let mut item = Item::new(&key, ItemKind::File);
            item.expires_at = now_secs() + 60;
            item.body_size = 100;
            index.add(item).unwrap();
            hashes.push(key.hash);
        }
        assert_eq!(index.stat().unwrap().count, 10);

        index.remove(&hashes[3]).unwrap();
        assert!(!index.exist(&hashes[3]));
        assert!(index.exist(&hashes[4]));
        assert_eq!(index.stat().unwrap().count, 9);

        // nothing is expired yet
        assert!(index.purge(100).unwrap().is_empty());
        let evicted = index.purge_lfu(4).unwrap();
        assert_eq!(evicted.len(), 4);
        assert_eq!(index.count().unwrap(), 5);
        index.close().unwrap();
    }
}

#[test]
fn memory_tier_capacity_and_recovery() {
    let storage = MemoryStorage::new(
        MemoryStorageConfig {
            capacity_bytes: 64 * 1024,
            purge_interval_secs: 0,
            ..Default::default()
        },
        BufferPool::new(BufferPoolConfig::default()),
        None,
    );
    storage.init().unwrap();
    assert_eq!(storage.kind(), StorageKind::Memory);

    let put = |name: &str, len: usize| -> edge_cache::Result<()> {
        let opts = WriteOptions::new(now_secs() + 60, 200).with_body_size(len as u64);
        let mut writer = storage.open_writer(&CacheKey::new(name), opts)?;
        writer.write(&body(len))?;
        writer.close()
    };

    put("a", 40 * 1024).unwrap();
    let err = put("b", 40 * 1024).err().unwrap();
    assert_matches!(err, Error::Capacity { .. });
    assert!(err.is_ignorable());

    assert!(storage.delete(&CacheKey::new("a")).unwrap());
    put("b", 40 * 1024).unwrap();
    assert_eq!(storage.metrics().rejections, 1);
}

#[test]
fn buffer_pool_reuses_returned_buffers() {
    let pool = BufferPool::new(BufferPoolConfig::default());
    let buf = pool.get(5000);
    assert_eq!(buf.len(), 5000);
    pool.put(buf);
    assert_eq!(pool.stat().items, 1);

    let again = pool.get(4000);
    assert_eq!(again.len(), 4000);
    let stat = pool.stat();
    assert_eq!(stat.items, 0);
    assert_eq!(stat.hits, 1);
    assert_eq!(stat.misses, 1);
}

#[test]
fn memory_front_flushes_to_disk() {
    let dir = TempDir::new().unwrap();
    let mut config = CacheConfig {
        kind: StorageKind::Memory,
        ..Default::default()
    };
    config.disk.dir = dir.path().to_path_buf();
    config.disk.purge_interval_secs = 0;
    config.memory.purge_interval_secs = 0;
    config.memory.flush_workers = 2;

    let keys: Vec<CacheKey> = (0..5)
        .map(|i| CacheKey::new(format!("https://cdn.example.com/hot/{}", i)))
        .collect();
    {
        let stack = CacheStack::new(config.clone()).unwrap();
        stack.start().unwrap();
        for key in &keys {
            write(&stack, key, &body(50_000)).unwrap();
        }
        // stopping drains the flush queue into disk
        stack.stop();
    }

    config.kind = StorageKind::Disk;
    let stack = CacheStack::new(config).unwrap();
    stack.start().unwrap();
    for key in &keys {
        let mut reader = stack.open_reader(key, ReadOptions::fresh()).unwrap();
        assert_eq!(reader.read_body().unwrap().len(), 50_000);
    }
}
