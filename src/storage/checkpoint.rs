//! Checkpoint files: the durable image of every column family
//!
//! A checkpoint is written atomically (temp file + rename) and holds one
//! block per column family:
//! `[cf u8][len u32][crc32 u32][snappy(bincode entries)]`
//! where entries are the sorted `(key, value)` pairs of the latest
//! committed versions. After a checkpoint lands, the WAL starts empty.

use super::ColumnFamily;
use crate::{LateError, Result};
use crc32fast::Hasher;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

pub(crate) type CfEntries = Vec<(Vec<u8>, Vec<u8>)>;

/// Write all families to `path`, atomically
pub(crate) fn write(path: &Path, families: &[(ColumnFamily, CfEntries)]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        for (cf, entries) in families {
            let raw = bincode::serialize(entries)?;
            let payload = snap::raw::Encoder::new()
                .compress_vec(&raw)
                .map_err(|e| LateError::Storage(format!("checkpoint compress: {}", e)))?;

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let crc = hasher.finalize();

            file.write_all(&[*cf as u8])?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&payload)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

/// Read every family block back
pub(crate) fn read(path: &Path) -> Result<Vec<(ColumnFamily, CfEntries)>> {
    let mut file = File::open(path)?;
    let mut families = Vec::new();

    loop {
        let mut header = [0u8; 9];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let cf = ColumnFamily::from_u8(header[0]).ok_or_else(|| {
            LateError::Corruption(format!("checkpoint: unknown column family {}", header[0]))
        })?;
        let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        let expected_crc = u32::from_le_bytes(header[5..9].try_into().unwrap());

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)
            .map_err(|_| LateError::Corruption("checkpoint block truncated".into()))?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(LateError::Corruption(
                "checkpoint block checksum mismatch".into(),
            ));
        }

        let raw = snap::raw::Decoder::new()
            .decompress_vec(&payload)
            .map_err(|e| LateError::Corruption(format!("checkpoint decompress: {}", e)))?;
        let entries: CfEntries = bincode::deserialize(&raw)?;
        families.push((cf, entries));
    }

    Ok(families)
}

/// Hard-link `src` into `dst`, falling back to a byte copy across
/// filesystems
pub(crate) fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }
    Ok(())
}

fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
