//! Directory listing adapter (§6, Design Notes "Directory reading").
//!
//! A `Tread` against a directory fid returns concatenated stat records
//! rather than raw bytes. This module computes how many entries can fit
//! in the requested byte count and marshals them.

use crate::fcall::{Stat, MAX_FILENAME_LEN, MAX_UID_LEN};
use crate::file::File;
use crate::utils::Result;

/// Upper bound on the encoded size of any single stat record, used to
/// decide how many directory entries to request before knowing their
/// actual encoded size.
fn max_stat_size() -> u32 {
    let fixed = 2 + 2 + 4 + 13 + 4 + 4 + 4 + 8u32; // size-prefix + typ + dev + qid + mode + atime + mtime + length
    let name = (2 + MAX_FILENAME_LEN) as u32;
    let uid = (2 + MAX_UID_LEN) as u32;
    fixed + name + uid + uid + uid
}

/// Reads up to `count` bytes worth of directory entries starting at
/// `offset`, returning the encoded stat records concatenated and the
/// byte offset the next call should resume from.
pub async fn read_dir(file: &dyn File, offset: u64, count: u32) -> Result<Vec<u8>> {
    let max_entries = (count / max_stat_size().max(1)).max(1);
    let entries = match file.readdir(offset, max_entries).await {
        Some(result) => result?,
        None => return Err(crate::error::Error::protocol("not a directory")),
    };

    let mut out = Vec::new();
    for entry in entries {
        let encoded = encode_stat(&entry.stat);
        if out.len() + encoded.len() > count as usize {
            break;
        }
        out.extend_from_slice(&encoded);
    }
    Ok(out)
}

fn encode_stat(stat: &Stat) -> Vec<u8> {
    use crate::serialize::Encodable;
    let mut bytes = Vec::new();
    stat.encode(&mut bytes).expect("encoding into a Vec never fails");
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::{Qid, QidType};
    use crate::file::DirEntry;
    use async_trait::async_trait;

    struct FixedDir(Vec<DirEntry>);

    #[async_trait]
    impl File for FixedDir {
        async fn read_at(&self, _offset: u64, _count: u32) -> Result<Vec<u8>> {
            Err(crate::error::Error::protocol("is a directory"))
        }
        async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<u32> {
            Err(crate::error::Error::protocol("is a directory"))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn readdir(&self, offset: u64, count: u32) -> Option<Result<Vec<DirEntry>>> {
            let start = self.0.iter().position(|e| e.offset >= offset).unwrap_or(self.0.len());
            let end = (start + count as usize).min(self.0.len());
            Some(Ok(self.0[start..end].to_vec()))
        }
    }

    fn entry(name: &str, at: u64) -> DirEntry {
        DirEntry {
            stat: Stat {
                typ: 0,
                dev: 0,
                qid: Qid { typ: QidType::FILE, version: 0, path: at },
                mode: 0o644,
                atime: 0,
                mtime: 0,
                length: 0,
                name: name.to_owned(),
                uid: "glenda".to_owned(),
                gid: "glenda".to_owned(),
                muid: String::new(),
            },
            offset: at + 1,
        }
    }

    #[tokio::test]
    async fn reads_entries_bounded_by_count() {
        let dir = FixedDir(vec![entry("a", 0), entry("b", 1), entry("c", 2)]);
        let bytes = read_dir(&dir, 0, 8192).await.unwrap();
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn non_directory_yields_a_protocol_error() {
        struct Plain;
        #[async_trait]
        impl File for Plain {
            async fn read_at(&self, _: u64, _: u32) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
            async fn write_at(&self, _: u64, _: &[u8]) -> Result<u32> {
                Ok(0)
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }
        let err = read_dir(&Plain, 0, 100).await;
        assert!(err.is_err());
    }
}
