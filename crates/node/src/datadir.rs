//! Data-directory lock, pid file and the post-shutdown erase directive.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

pub const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
pub const PID_FILE_NAME: &str = "dualchaind.pid";
pub const DEBUG_LOG_FILE_NAME: &str = "debug.log";
pub const MEMPOOL_FILE_NAME: &str = "mempool.dat";
pub const FEE_ESTIMATES_FILE_NAME: &str = "fee_estimates.dat";
pub const BANLIST_FILE_NAME: &str = "banlist.dat";
pub const PEERS_FILE_NAME: &str = "peers.dat";

const TRANSIENT_ENTRIES: &[&str] = &["autocheckpoints", BANLIST_FILE_NAME, PEERS_FILE_NAME];
const CHAIN_DATA_ENTRIES: &[&str] = &[
    "blocks",
    "chainstate",
    "witstate",
    "database",
    "db.log",
    MEMPOOL_FILE_NAME,
    FEE_ESTIMATES_FILE_NAME,
];

/// What to remove from the data directory once teardown is complete.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShutdownDirective {
    pub erase_transient: bool,
    pub erase_chain_data: bool,
}

/// Held for the life of the process; dropping it releases the lock.
pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "Cannot obtain a lock on data directory {} (another dualchaind instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "Cannot obtain a lock on data directory {} (another dualchaind instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub fn write_pid_file(data_dir: &Path) -> Result<PathBuf, String> {
    let path = data_dir.join(PID_FILE_NAME);
    fs::write(&path, format!("{}\n", std::process::id()))
        .map_err(|err| format!("Unable to create the PID file '{}': {err}", path.display()))?;
    Ok(path)
}

pub fn remove_pid_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log_warn!("failed to remove {}: {err}", path.display());
        }
    }
}

/// Removes what `directive` names under `data_dir` and returns the paths that existed.
pub fn apply_shutdown_directive(data_dir: &Path, directive: ShutdownDirective) -> Vec<PathBuf> {
    let mut targets: Vec<&str> = Vec::new();
    if directive.erase_transient || directive.erase_chain_data {
        targets.extend_from_slice(TRANSIENT_ENTRIES);
    }
    if directive.erase_chain_data {
        targets.extend_from_slice(CHAIN_DATA_ENTRIES);
    }

    let mut removed = Vec::new();
    for name in targets {
        let path = data_dir.join(name);
        let result = match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                log_info!("Removed {}", path.display());
                removed.push(path);
            }
            Err(err) => log_warn!("failed to remove {}: {err}", path.display()),
        }
    }
    removed
}
