use dualchain_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod backend;
pub mod budget;
pub mod collaborators;
pub mod config;
pub mod datadir;
pub mod fee_estimator;
pub mod host;
pub mod import;
pub mod lifecycle;
pub mod mempool;
pub mod phase;
pub mod rpc;
pub mod sanity;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::collaborators::Collaborators;
use crate::config::{CliAction, Config};
use crate::host::HostCapacity;
use crate::lifecycle::{Orchestrator, StartupOutcome};
use crate::phase::ShutdownRequest;

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("dualchaind {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    let collaborators = Collaborators::reference(&config);
    let orchestrator = Arc::new(
        Orchestrator::new(config, HostCapacity::probe(), collaborators).with_signal_handlers(),
    );

    let result = match orchestrator.startup().await {
        Ok(StartupOutcome::Running) => {
            orchestrator.wait_for_shutdown_request().await;
            Ok(())
        }
        Ok(StartupOutcome::DidNotStart) => {
            log_info!("Startup: node did not start");
            Ok(())
        }
        Err(err) => {
            log_error!("Error: {err}");
            Err(err.to_string())
        }
    };

    orchestrator.shutdown().await;
    if let Some(failure) = orchestrator.import_failure() {
        return Err(failure);
    }
    result
}

/// SIGINT and SIGTERM request shutdown; SIGHUP reopens `debug.log`.
pub(crate) fn spawn_signal_handlers(shutdown: ShutdownRequest) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                log_warn!("failed to install SIGHUP handler: {err}");
                return;
            }
        };
        while sighup.recv().await.is_some() {
            log_debug!("SIGHUP received; reopening log file");
            logging::request_reopen();
        }
    });

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.request();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        shutdown.request();
    });
}

pub(crate) fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| err.to_string())?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path).map_err(|err| err.to_string())?;
    }
    Ok(())
}

pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1_000_000)
}

pub(crate) fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("snapshot.dat");
        write_file_atomic(&path, b"first").expect("write");
        write_file_atomic(&path, b"second").expect("rewrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        assert!(!path.with_extension("tmp").exists());
    }
}
