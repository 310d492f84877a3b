//! Lower block device: the local store a replicated device is backed by.
//!
//! The handle is exclusively owned by one device until teardown; a global
//! claim table refuses a second configuration of the same path. Block I/O is
//! positioned and runs on the blocking pool so completions never stall the
//! runtime.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

use crate::error::{MirrorError, Result};

fn claimed() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

pub struct LowerDevice {
    file: Arc<File>,
    path: PathBuf,
    size_kib: u64,
}

impl LowerDevice {
    /// Claim and open the backing store.
    ///
    /// `size_hint_kib` caps the usable size; it must fit inside the backing
    /// store (`LowerDeviceTooSmall` otherwise).
    pub fn open(path: &Path, size_hint_kib: Option<u64>) -> Result<Self> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        {
            let mut set = claimed().lock().expect("claim table poisoned");
            if !set.insert(canonical.clone()) {
                return Err(MirrorError::LowerDeviceInUse(canonical));
            }
        }

        let opened = OpenOptions::new().read(true).write(true).open(path);
        let file = match opened {
            Ok(f) => f,
            Err(source) => {
                claimed()
                    .lock()
                    .expect("claim table poisoned")
                    .remove(&canonical);
                return Err(MirrorError::LowerDeviceOpenFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let have_kib = match file.metadata() {
            Ok(m) => m.len() >> 10,
            Err(source) => {
                claimed()
                    .lock()
                    .expect("claim table poisoned")
                    .remove(&canonical);
                return Err(MirrorError::LowerDeviceOpenFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if let Some(need_kib) = size_hint_kib {
            if have_kib < need_kib {
                claimed()
                    .lock()
                    .expect("claim table poisoned")
                    .remove(&canonical);
                return Err(MirrorError::LowerDeviceTooSmall { have_kib, need_kib });
            }
        }

        Ok(Self {
            file: Arc::new(file),
            path: canonical,
            size_kib: size_hint_kib.unwrap_or(have_kib),
        })
    }

    /// Usable size in KiB.
    pub fn size_kib(&self) -> u64 {
        self.size_kib
    }

    /// Canonical path of the claimed backing store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read_block(&self, block_nr: u64, block_size: usize) -> Result<Bytes> {
        let file = Arc::clone(&self.file);
        let offset = block_nr * block_size as u64;
        let data = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; block_size];
            file.read_exact_at(&mut buf, offset)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| MirrorError::Io(std::io::Error::other(e)))??;
        Ok(Bytes::from(data))
    }

    pub async fn write_block(&self, block_nr: u64, data: Bytes) -> Result<()> {
        let file = Arc::clone(&self.file);
        let offset = block_nr * data.len() as u64;
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| MirrorError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Flush outstanding writes to the backing store.
    pub async fn sync(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| MirrorError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

impl Drop for LowerDevice {
    fn drop(&mut self) {
        claimed()
            .lock()
            .expect("claim table poisoned")
            .remove(&self.path);
    }
}
