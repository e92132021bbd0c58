use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::BrokerError;

/// Append-only record file: `[len u32 LE][crc32 u32 LE][payload]`.
///
/// Replay stops at the first record whose checksum fails or whose header is
/// incomplete, truncating the file there — a torn tail from a crash loses
/// at most the unflushed record, never the log.
pub struct Journal {
    path: PathBuf,
    file: File,
}

fn record_checksum(len_bytes: [u8; 4], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_bytes);
    hasher.update(payload);
    hasher.finalize()
}

impl Journal {
    /// Opens (creating if needed) and replays existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Vec<u8>>), BrokerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut records = Vec::new();
        let mut valid_len: u64 = 0;
        if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            let mut offset = 0usize;
            while raw.len() - offset >= 8 {
                let len_bytes: [u8; 4] = raw[offset..offset + 4]
                    .try_into()
                    .map_err(|_| BrokerError::Corrupt(path.clone()))?;
                let crc_bytes: [u8; 4] = raw[offset + 4..offset + 8]
                    .try_into()
                    .map_err(|_| BrokerError::Corrupt(path.clone()))?;
                let len = u32::from_le_bytes(len_bytes) as usize;
                let Some(end) = offset.checked_add(8).and_then(|s| s.checked_add(len)) else {
                    break;
                };
                if end > raw.len() {
                    break;
                }
                let payload = &raw[offset + 8..end];
                if record_checksum(len_bytes, payload) != u32::from_le_bytes(crc_bytes) {
                    break;
                }
                records.push(payload.to_vec());
                offset = end;
                valid_len = offset as u64;
            }
            if (offset as u64) < std::fs::metadata(&path)?.len() {
                tracing::warn!(
                    journal = %path.display(),
                    truncated_at = valid_len,
                    "recovered journal from partial write"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((Self { path, file }, records))
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<(), BrokerError> {
        let len = u32::try_from(payload.len()).map_err(|_| BrokerError::Corrupt(self.path.clone()))?;
        let len_bytes = len.to_le_bytes();
        let crc = record_checksum(len_bytes, payload);
        let mut record = Vec::with_capacity(8 + payload.len());
        record.extend_from_slice(&len_bytes);
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(payload);
        self.file.write_all(&record)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
