//! Write-ahead log
//!
//! One frame per committed batch, written before the batch is applied.
//! Frame layout: `[len u32][crc32 u32][snappy(bincode ops)]`. Recovery
//! stops at the first torn or corrupt frame and truncates the file
//! there, so a crash mid-append never blocks open.

use super::BatchOp;
use crate::config::DurabilityLevel;
use crate::{LateError, Result};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub(crate) struct Wal {
    file: File,
    durability: DurabilityLevel,
}

impl Wal {
    /// Open (or create) the log and replay intact frames
    pub(crate) fn open(
        path: impl AsRef<Path>,
        durability: DurabilityLevel,
    ) -> Result<(Self, Vec<Vec<BatchOp>>)> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let (batches, valid_len) = Self::replay(&mut file)?;
        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            tracing::warn!(
                path = %path.display(),
                dropped = actual_len - valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((Self { file, durability }, batches))
    }

    fn replay(file: &mut File) -> Result<(Vec<Vec<BatchOp>>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut batches = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut header = [0u8; 8];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            let expected_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());

            let mut payload = vec![0u8; len];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != expected_crc {
                // torn or corrupt frame, everything after it is suspect
                break;
            }

            let raw = snap::raw::Decoder::new()
                .decompress_vec(&payload)
                .map_err(|e| LateError::Corruption(format!("WAL decompress: {}", e)))?;
            let ops: Vec<BatchOp> = bincode::deserialize(&raw)?;
            batches.push(ops);
            valid_len += 8 + len as u64;
        }

        Ok((batches, valid_len))
    }

    /// Append one committed batch
    pub(crate) fn append(&mut self, ops: &[BatchOp]) -> Result<()> {
        let raw = bincode::serialize(ops)?;
        let payload = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| LateError::Storage(format!("WAL compress: {}", e)))?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame)?;
        if self.durability == DurabilityLevel::Synchronous {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop all frames after a checkpoint made them redundant
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_data()?;
        Ok(())
    }
}
