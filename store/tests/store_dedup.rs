//! Cross-client dedup through the hash-linked store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkstore::db::{entries, Database, EntryIndex, IndexKey};
use chunkstore::hash::StrongHash;
use chunkstore::sidecar;
use chunkstore::store::{AddFileOutcome, AddFileRequest, HashStore, IngestSource, StoreEnv};
use rand::{RngCore, SeedableRng};

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    env: Arc<StoreEnv>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let db = Arc::new(Database::open(&root.join("meta.db")).unwrap());
    let index = Arc::new(EntryIndex::new(Arc::clone(&db)));
    let mut env = StoreEnv::new(Arc::clone(&db), index, root.clone());
    env.open_retry_wait = std::time::Duration::from_millis(1);
    Fixture {
        _dir: dir,
        root,
        env: Arc::new(env),
    }
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn strong_hash_of(data: &[u8]) -> [u8; 64] {
    let mut h = StrongHash::new();
    h.update(data);
    h.finalize()
}

fn metadata_for(path: &str, data: &[u8], strong: &[u8; 64]) -> sidecar::FileMetadata {
    sidecar::FileMetadata {
        orig_path: path.to_string(),
        file_size: data.len() as i64,
        rsize: 0,
        uid: 1000,
        gid: 1000,
        mode: 0o644,
        created: 1_700_000_000,
        modified: 1_700_000_050,
        strong_hash: hex::encode(strong),
    }
}

/// Stage `data` as a received temp file and ingest it for `clientid`.
fn ingest(
    fx: &Fixture,
    store: &mut HashStore,
    clientid: i64,
    name: &str,
    data: &[u8],
) -> AddFileOutcome {
    let client_dir = fx.root.join(format!("c{}", clientid));
    fs::create_dir_all(&client_dir).unwrap();

    let temp_path = fx.root.join(format!("incoming-{}-{}", clientid, name));
    fs::write(&temp_path, data).unwrap();

    let strong = strong_hash_of(data);
    store
        .add_file(AddFileRequest {
            source: IngestSource::Full {
                temp_path: temp_path.clone(),
            },
            dest_path: client_dir.join(name),
            hash_dest_path: client_dir.join(format!("{}.hashes", name)),
            strong_hash: strong,
            file_size: data.len() as i64,
            backupid: 1,
            incremental: 0,
            metadata: metadata_for(name, data, &strong),
            extents: Vec::new(),
        })
        .unwrap()
}

fn list_len(db: &Database, head: i64) -> usize {
    let mut n = 0;
    let mut cur = head;
    let mut back = 0;
    while cur != 0 {
        let e = entries::get_entry(db, cur).unwrap().unwrap();
        assert_eq!(e.prev_entry, back, "backward pointer mismatch at {}", cur);
        back = cur;
        cur = e.next_entry;
        n += 1;
    }
    n
}

#[cfg(unix)]
fn nlink(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).unwrap().nlink()
}

#[test]
fn second_client_links_instead_of_copying() {
    let fx = fixture();
    let data = random_bytes(7, 3 * 1024 * 1024);

    let mut store1 = HashStore::new(Arc::clone(&fx.env), 1);
    let first = ingest(&fx, &mut store1, 1, "report.bin", &data);
    assert!(!first.linked);
    assert_eq!(first.rsize, data.len() as i64);

    let mut store2 = HashStore::new(Arc::clone(&fx.env), 2);
    let second = ingest(&fx, &mut store2, 2, "copy.bin", &data);
    assert!(second.linked, "identical content must hard-link");
    assert_eq!(second.rsize, 0);

    #[cfg(unix)]
    {
        assert_eq!(nlink(&fx.root.join("c1/report.bin")), 2);
    }

    // the index maps each client to its own entry
    let strong = strong_hash_of(&data);
    let id2 = fx
        .env
        .index
        .get_with_cache_exact(&IndexKey::new(&strong, data.len() as i64, 2))
        .unwrap();
    assert_eq!(id2, second.entry_id);

    // one chain of length 2, walkable both ways
    assert_eq!(list_len(&fx.env.db, first.entry_id), 2);

    // both copies decode to the original bytes
    assert_eq!(fs::read(fx.root.join("c2/copy.bin")).unwrap(), data);
}

#[test]
fn delete_one_client_keeps_the_other_intact() {
    let fx = fixture();
    let data = random_bytes(8, 2 * 1024 * 1024);
    let strong = strong_hash_of(&data);

    let mut store1 = HashStore::new(Arc::clone(&fx.env), 1);
    let first = ingest(&fx, &mut store1, 1, "a.bin", &data);
    let mut store2 = HashStore::new(Arc::clone(&fx.env), 2);
    let second = ingest(&fx, &mut store2, 2, "b.bin", &data);

    store1.delete_entry(first.entry_id, None).unwrap();

    // client 1's key is gone, client 2's survives
    assert_eq!(
        fx.env
            .index
            .get_with_cache_exact(&IndexKey::new(&strong, data.len() as i64, 1))
            .unwrap(),
        0
    );
    assert_eq!(
        fx.env
            .index
            .get_with_cache_exact(&IndexKey::new(&strong, data.len() as i64, 2))
            .unwrap(),
        second.entry_id
    );

    assert_eq!(list_len(&fx.env.db, second.entry_id), 1);

    // the physical bytes are still there through the second name
    assert!(fx.root.join("c1/a.bin").exists());
    assert_eq!(fs::read(fx.root.join("c2/b.bin")).unwrap(), data);
}

#[test]
fn same_client_second_copy_extends_its_chain() {
    let fx = fixture();
    let data = random_bytes(9, 1024 * 1024);

    let mut store = HashStore::new(Arc::clone(&fx.env), 1);
    let first = ingest(&fx, &mut store, 1, "one.bin", &data);
    let second = ingest(&fx, &mut store, 1, "two.bin", &data);

    assert!(second.linked);
    assert_eq!(list_len(&fx.env.db, first.entry_id), 2);

    // the key stays on the pointed-to entry
    let strong = strong_hash_of(&data);
    let key_target = fx
        .env
        .index
        .get_with_cache_exact(&IndexKey::new(&strong, data.len() as i64, 1))
        .unwrap();
    let pointed = entries::get_entry(&fx.env.db, key_target).unwrap().unwrap();
    assert!(pointed.pointed_to);
}

#[test]
fn small_files_always_copy() {
    let fx = fixture();
    let data = random_bytes(10, 512);

    let mut store1 = HashStore::new(Arc::clone(&fx.env), 1);
    let first = ingest(&fx, &mut store1, 1, "tiny.bin", &data);
    assert!(!first.linked);
    assert_eq!(first.rsize, data.len() as i64);

    let mut store2 = HashStore::new(Arc::clone(&fx.env), 2);
    let second = ingest(&fx, &mut store2, 2, "tiny.bin", &data);
    assert!(!second.linked, "below the link threshold nothing links");

    #[cfg(unix)]
    {
        assert_eq!(nlink(&fx.root.join("c1/tiny.bin")), 1);
    }

    let strong = strong_hash_of(&data);
    assert_eq!(
        fx.env
            .index
            .get_with_cache_exact(&IndexKey::new(&strong, data.len() as i64, 1))
            .unwrap(),
        0,
        "small files never touch the index"
    );
}

#[test]
fn linked_copy_gets_its_own_sidecar_with_fresh_metadata() {
    let fx = fixture();
    let data = random_bytes(11, 1024 * 1024);

    let mut store1 = HashStore::new(Arc::clone(&fx.env), 1);
    ingest(&fx, &mut store1, 1, "orig.bin", &data);
    let mut store2 = HashStore::new(Arc::clone(&fx.env), 2);
    let second = ingest(&fx, &mut store2, 2, "linked.bin", &data);
    assert!(second.linked);

    let mut side = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(fx.root.join("c2/linked.bin.hashes"))
        .unwrap();
    let meta = sidecar::read_metadata(&mut side).unwrap();
    assert_eq!(meta.rsize, 0, "linked copies report no physical bytes");
    assert_eq!(meta.orig_path, "linked.bin");
    assert_eq!(meta.strong_hash, hex::encode(strong_hash_of(&data)));

    // hash records were carried over from the candidate's sidecar
    assert!(sidecar::read_record(&mut side, 0).unwrap().is_some());
}

#[test]
fn dead_candidate_is_dropped_and_ingest_copies() {
    let fx = fixture();
    let data = random_bytes(12, 1024 * 1024);

    let mut store1 = HashStore::new(Arc::clone(&fx.env), 1);
    let first = ingest(&fx, &mut store1, 1, "gone.bin", &data);

    // the stored file vanishes behind the store's back
    fs::remove_file(fx.root.join("c1/gone.bin")).unwrap();

    let mut store2 = HashStore::new(Arc::clone(&fx.env), 2);
    let second = ingest(&fx, &mut store2, 2, "fresh.bin", &data);
    assert!(!second.linked, "no live candidate, so the bytes are copied");
    assert_eq!(fs::read(fx.root.join("c2/fresh.bin")).unwrap(), data);

    // the dead entry was deleted during the walk
    assert!(entries::get_entry(&fx.env.db, first.entry_id)
        .unwrap()
        .is_none());
}
