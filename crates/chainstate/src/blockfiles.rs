//! Block and undo flat files living side by side under `blocks/`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use dualchain_log::{log_debug, log_info};

use crate::flatfiles::{FileLocation, FlatFileError, FlatFileStore};

pub const BLOCK_FILE_PREFIX: &str = "blk";
pub const UNDO_FILE_PREFIX: &str = "rev";
pub const MAX_BLOCK_FILE_SIZE: u64 = 128 * 1024 * 1024;

const NUMBERED_FILE_NAME_LEN: usize = 12;

pub struct BlockFiles {
    blocks: FlatFileStore,
    undo: FlatFileStore,
}

impl BlockFiles {
    pub fn open(dir: impl AsRef<Path>, magic: [u8; 4]) -> Result<Self, FlatFileError> {
        let dir = dir.as_ref();
        Ok(Self {
            blocks: FlatFileStore::new_with_prefix(
                dir,
                BLOCK_FILE_PREFIX,
                magic,
                MAX_BLOCK_FILE_SIZE,
            )?,
            undo: FlatFileStore::new_with_prefix(
                dir,
                UNDO_FILE_PREFIX,
                magic,
                MAX_BLOCK_FILE_SIZE,
            )?,
        })
    }

    pub fn dir(&self) -> &Path {
        self.blocks.dir()
    }

    pub fn append_block(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        self.blocks.append(bytes)
    }

    pub fn read_block(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.blocks.read(location)
    }

    /// Undo data lives in the `rev` file numbered like the block's `blk` file.
    pub fn append_undo(&self, block_file: u32, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        self.undo.append_to_file(block_file, bytes)
    }

    pub fn read_undo(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.undo.read(location)
    }

    pub fn open_block_file(&self, file_id: u32) -> Result<Option<File>, FlatFileError> {
        self.blocks.open_file(file_id)
    }

    pub fn block_file_path(&self, file_id: u32) -> PathBuf {
        self.blocks.file_path(file_id)
    }

    pub fn undo_file_path(&self, file_id: u32) -> PathBuf {
        self.undo.file_path(file_id)
    }

    pub fn current_block_file(&self) -> Result<u32, FlatFileError> {
        self.blocks.current_file()
    }

    pub fn sync(&self) -> Result<(), FlatFileError> {
        let current = self.blocks.current_file()?;
        self.blocks.sync_file(current)?;
        self.undo.sync_file(current)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NumberedFileKind {
    Block,
    Undo,
}

/// Parses `blkNNNNN.dat` / `revNNNNN.dat`. Any other shape is not ours.
pub fn parse_numbered_file_name(name: &str) -> Option<(NumberedFileKind, u32)> {
    if name.len() != NUMBERED_FILE_NAME_LEN || !name.ends_with(".dat") {
        return None;
    }
    let kind = if name.starts_with(BLOCK_FILE_PREFIX) {
        NumberedFileKind::Block
    } else if name.starts_with(UNDO_FILE_PREFIX) {
        NumberedFileKind::Undo
    } else {
        return None;
    };
    let digits = name.get(3..8)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|id| (kind, id))
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReindexCleanup {
    pub removed_undo: Vec<PathBuf>,
    pub removed_blocks: Vec<PathBuf>,
    pub kept_blocks: u32,
}

/// Deletes every undo file and every block file past the first gap in the numbering.
pub fn cleanup_block_rev_files(dir: impl AsRef<Path>) -> Result<ReindexCleanup, FlatFileError> {
    let dir = dir.as_ref();
    log_info!(
        "Removing unusable blk?????.dat and rev?????.dat files for -reindex with -prune"
    );
    let mut report = ReindexCleanup::default();
    let mut block_files = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_numbered_file_name(name) {
            Some((NumberedFileKind::Block, id)) => {
                block_files.insert(id, entry.path());
            }
            Some((NumberedFileKind::Undo, _)) => {
                std::fs::remove_file(entry.path())?;
                report.removed_undo.push(entry.path());
            }
            None => {}
        }
    }

    let mut contiguous = 0u32;
    for (id, path) in block_files {
        if id == contiguous {
            contiguous += 1;
            continue;
        }
        log_debug!("Removing {} past block file gap", path.display());
        std::fs::remove_file(&path)?;
        report.removed_blocks.push(path);
    }
    report.kept_blocks = contiguous;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_names_must_be_exact() {
        assert_eq!(
            parse_numbered_file_name("blk00012.dat"),
            Some((NumberedFileKind::Block, 12))
        );
        assert_eq!(
            parse_numbered_file_name("rev00000.dat"),
            Some((NumberedFileKind::Undo, 0))
        );
        assert_eq!(parse_numbered_file_name("blk0001.dat"), None);
        assert_eq!(parse_numbered_file_name("blk000001.dat"), None);
        assert_eq!(parse_numbered_file_name("blkabcde.dat"), None);
        assert_eq!(parse_numbered_file_name("foo00000.dat"), None);
        assert_eq!(parse_numbered_file_name("blk00000.txt"), None);
    }

    #[test]
    fn cleanup_keeps_contiguous_block_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["blk00000.dat", "blk00002.dat", "rev00000.dat", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        let report = cleanup_block_rev_files(dir.path()).expect("cleanup");
        assert_eq!(report.kept_blocks, 1);
        assert_eq!(report.removed_undo.len(), 1);
        assert_eq!(report.removed_blocks.len(), 1);

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".dat"))
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["blk00000.dat".to_string()]);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn cleanup_removes_everything_when_first_file_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("blk00001.dat"), b"x").expect("write");
        let report = cleanup_block_rev_files(dir.path()).expect("cleanup");
        assert_eq!(report.kept_blocks, 0);
        assert!(!dir.path().join("blk00001.dat").exists());
    }
}
