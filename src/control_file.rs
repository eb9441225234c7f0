//! Durable control-file persistence (C9): the external persister the
//! allocator checkpoints `control_xid` into, modeled on `postgrustql`'s
//! `WalManager` (create/open/flush discipline, `bincode` encoding).

use crate::error::{GtmError, GtmResult};
use crate::gxid::Gxid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// `load_control()`/`save_control()` from spec.md §6. The GTM core's only
/// contribution to the control file is the checkpointed `next_xid`;
/// everything else about the file (version headers, other subsystems'
/// checkpoints) belongs to the owning process, out of scope here.
pub trait ControlFile: Send + Sync {
    fn load(&self) -> GtmResult<Gxid>;
    fn save(&self, xid: Gxid) -> GtmResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlRecord {
    next_xid: u32,
}

/// File-backed control file: a single small `bincode` record written with
/// a write-to-temp-then-rename so a crash mid-write never leaves a
/// corrupt file in place.
pub struct FileControlFile {
    path: PathBuf,
}

impl FileControlFile {
    pub fn new(data_dir: impl AsRef<Path>) -> GtmResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        Ok(FileControlFile {
            path: data_dir.join("gtm_control"),
        })
    }
}

impl ControlFile for FileControlFile {
    fn load(&self) -> GtmResult<Gxid> {
        if !self.path.exists() {
            return Ok(Gxid::FIRST_NORMAL);
        }
        let bytes = fs::read(&self.path)?;
        let record: ControlRecord =
            bincode::deserialize(&bytes).map_err(|e| GtmError::ControlFile(e.to_string()))?;
        Ok(Gxid::new(record.next_xid))
    }

    fn save(&self, xid: Gxid) -> GtmResult<()> {
        let record = ControlRecord { next_xid: xid.raw() };
        let encoded = bincode::serialize(&record).map_err(|e| GtmError::ControlFile(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(xid = %xid, "checkpointed control file");
        Ok(())
    }
}

/// A control file that persists nothing, for tests and for running the
/// allocator in isolation from the filesystem.
pub struct NullControlFile;

impl ControlFile for NullControlFile {
    fn load(&self) -> GtmResult<Gxid> {
        Ok(Gxid::FIRST_NORMAL)
    }

    fn save(&self, _xid: Gxid) -> GtmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let cf = FileControlFile::new(dir.path()).unwrap();
        cf.save(Gxid::new(12345)).unwrap();
        assert_eq!(cf.load().unwrap(), Gxid::new(12345));
    }

    #[test]
    fn missing_file_bootstraps_to_first_normal() {
        let dir = TempDir::new().unwrap();
        let cf = FileControlFile::new(dir.path()).unwrap();
        assert_eq!(cf.load().unwrap(), Gxid::FIRST_NORMAL);
    }
}
