//! The restoring decoder.
//!
//! A container is self-describing: the last 8 bytes give the block-map
//! length, the block-map gives every block's original input position (or
//! marks it as padding), and the body is walked sequentially. Blocks that
//! were written out of input order are parked until the stream reaches
//! their position.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{bail, Context};
use chunkstore::cdc::MAX_CHUNK;

use crate::encode::{MAGIC, PAD_MARKER};

const HEADER_LEN: u64 = MAGIC.len() as u64 + 4;

/// Restore the original byte stream of a container.
pub fn restore<I, O>(input: &mut I, out: &mut O) -> anyhow::Result<()>
where
    I: Read + Seek,
    O: Write,
{
    let total = input.seek(SeekFrom::End(0))?;
    if total < HEADER_LEN + 8 {
        bail!("container too short ({} bytes)", total);
    }

    input.seek(SeekFrom::End(-8))?;
    let mut raw = [0u8; 8];
    input.read_exact(&mut raw).context("reading block-map size")?;
    let bmsize = i64::from_le_bytes(raw);

    let bm_bytes = (bmsize as u64).checked_mul(4);
    let blockmap_off = bm_bytes.and_then(|b| (total - 8).checked_sub(b));
    let blockmap_off = match (bmsize, blockmap_off) {
        (n, Some(off)) if n >= 0 && off >= HEADER_LEN => off,
        _ => bail!("block-map size {} out of range", bmsize),
    };

    input.seek(SeekFrom::Start(blockmap_off))?;
    let mut blockmap = vec![0i32; bmsize as usize];
    {
        let mut raw = vec![0u8; bmsize as usize * 4];
        input.read_exact(&mut raw).context("reading block map")?;
        for (i, slot) in blockmap.iter_mut().enumerate() {
            *slot = i32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
    }

    input.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 12];
    input.read_exact(&mut magic).context("reading magic")?;
    if &magic != MAGIC {
        bail!("not a blockalign container");
    }
    let mut raw_avg = [0u8; 4];
    input.read_exact(&mut raw_avg)?;
    let avg = u32::from_le_bytes(raw_avg);
    if avg == 0 {
        bail!("container announces a zero block size");
    }

    let mut parked: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
    let mut output_offset: i64 = 0;
    let mut nblock: usize = 0;
    let mut pos = HEADER_LEN;

    while pos < blockmap_off {
        let mut raw_len = [0u8; 2];
        input
            .read_exact(&mut raw_len)
            .context("reading block length")?;
        let blen = u16::from_le_bytes(raw_len);
        pos += 2;

        let pos_offset = match blockmap.get(nblock) {
            Some(&v) => v,
            None => bail!("body has more blocks than the block map"),
        };

        if pos_offset == PAD_MARKER {
            input.seek(SeekFrom::Current(blen as i64))?;
            pos += blen as u64;
            nblock += 1;
            continue;
        }

        if blen as usize > MAX_CHUNK {
            bail!("block {} longer than the chunk maximum", nblock);
        }

        let mut payload = vec![0u8; blen as usize];
        input.read_exact(&mut payload).context("reading block")?;
        pos += blen as u64;

        let block_pos = nblock as i64 * avg as i64 + pos_offset as i64;
        if block_pos < output_offset {
            bail!(
                "block {} wants position {} behind the restore cursor {}",
                nblock,
                block_pos,
                output_offset
            );
        }

        if block_pos == output_offset {
            out.write_all(&payload)?;
            output_offset += blen as i64;
            output_offset = drain_parked(&mut parked, output_offset, out)?;
        } else {
            parked.insert(block_pos, payload);
        }

        nblock += 1;
    }

    drain_parked(&mut parked, output_offset, out)?;
    if !parked.is_empty() {
        bail!("container leaves {} block(s) unplaced", parked.len());
    }
    Ok(())
}

/// Flush parked blocks that have become contiguous with the cursor.
fn drain_parked<O: Write>(
    parked: &mut BTreeMap<i64, Vec<u8>>,
    mut output_offset: i64,
    out: &mut O,
) -> anyhow::Result<i64> {
    while let Some(payload) = parked.remove(&output_offset) {
        out.write_all(&payload)?;
        output_offset += payload.len() as i64;
    }
    Ok(output_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::AlignEncoder;
    use crate::hashdb::HashDb;
    use std::io::Cursor;

    fn encode(data: &[u8], hashdb: HashDb) -> (Vec<u8>, Vec<u8>) {
        let mut out = Vec::new();
        let mut hashes = Vec::new();
        let enc = AlignEncoder::new(&mut out, &mut hashes, hashdb);
        enc.run(&mut &data[..]).unwrap();
        (out, hashes)
    }

    #[test]
    fn roundtrip_without_prior_hashes() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let (container, _) = encode(&data, HashDb::open("/nonexistent"));

        let mut restored = Vec::new();
        restore(&mut Cursor::new(container), &mut restored).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn empty_input_roundtrips() {
        let (container, hashes) = encode(&[], HashDb::open("/nonexistent"));
        assert!(hashes.is_empty());

        let mut restored = Vec::new();
        restore(&mut Cursor::new(container), &mut restored).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let data = vec![1u8; 5_000];
        let (mut container, _) = encode(&data, HashDb::open("/nonexistent"));
        container[0] ^= 0xFF;

        let mut restored = Vec::new();
        let err = restore(&mut Cursor::new(container), &mut restored).unwrap_err();
        assert!(err.to_string().contains("not a blockalign container"));
    }

    #[test]
    fn truncated_tail_is_rejected() {
        let data = vec![2u8; 5_000];
        let (container, _) = encode(&data, HashDb::open("/nonexistent"));
        let cut = container.len() - 3;

        let mut restored = Vec::new();
        assert!(restore(&mut Cursor::new(container[..cut].to_vec()), &mut restored).is_err());
    }

    #[test]
    fn oversized_blockmap_is_rejected() {
        let mut container = Vec::new();
        container.extend_from_slice(MAGIC);
        container.extend_from_slice(&546u32.to_le_bytes());
        container.extend_from_slice(&i64::MAX.to_le_bytes());

        let mut restored = Vec::new();
        assert!(restore(&mut Cursor::new(container), &mut restored).is_err());
    }

    use rand::{RngCore, SeedableRng};

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    fn hashdb_from(records: &[u8]) -> (tempfile::TempDir, HashDb) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes");
        std::fs::write(&path, records).unwrap();
        let db = HashDb::open(path.to_str().unwrap());
        (dir, db)
    }

    fn positional_identity(a: &[u8], b: &[u8]) -> f64 {
        let n = a.len().min(b.len());
        let same = (0..n).filter(|&i| a[i] == b[i]).count();
        same as f64 / n as f64
    }

    #[test]
    fn unchanged_input_reencodes_at_identical_offsets() {
        let data = random_bytes(42, 4 * 1024 * 1024);

        let (c0, hashes0) = encode(&data, HashDb::open("/nonexistent"));
        let (_dir, db) = hashdb_from(&hashes0);
        let (c1, _) = encode(&data, db);

        let mut restored = Vec::new();
        restore(&mut Cursor::new(c1.clone()), &mut restored).unwrap();
        assert_eq!(restored, data);

        let identity = positional_identity(&c0, &c1);
        assert!(
            identity >= 0.99,
            "only {:.2}% of container bytes kept their position",
            identity * 100.0
        );
    }

    #[test]
    fn insertion_only_disturbs_a_bounded_region() {
        let data = random_bytes(42, 4 * 1024 * 1024);
        let (c0, hashes0) = encode(&data, HashDb::open("/nonexistent"));

        let insert_at = 1024 * 1024;
        let mut edited = data[..insert_at].to_vec();
        edited.extend_from_slice(&random_bytes(43, 100));
        edited.extend_from_slice(&data[insert_at..]);

        let (_dir, db) = hashdb_from(&hashes0);
        let (c1, _) = encode(&edited, db);

        let mut restored = Vec::new();
        restore(&mut Cursor::new(c1.clone()), &mut restored).unwrap();
        assert_eq!(restored, edited);

        // content before the edit is untouched, content after it realigns
        // to its old offsets; only the edit region, occasional padding and
        // the shifted block map may differ
        let identity = positional_identity(&c0, &c1);
        assert!(
            identity >= 0.90,
            "only {:.2}% of container bytes kept their position",
            identity * 100.0
        );
    }
}
