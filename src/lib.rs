//! Syswatch is a syscall interception and correlation engine.
//!
//! Probes fire at the entry of filesystem-mutating syscalls, at kernel
//! functions called in the middle of them and at their return. The engine
//! correlates these observations per thread, resolves the identity of the
//! affected object exactly once and emits a single event per completed call.
//!
//! ```no_run
//! use bytes::Bytes;
//! use tokio::sync::mpsc;
//!
//! # fn main() -> anyhow::Result<()> {
//! syswatch::init_logger(None);
//! let config = syswatch::SyswatchConfig::new()?;
//! let (tx, _rx) = mpsc::channel::<Bytes>(4096);
//! let probes = syswatch::attach(&config, tx)?;
//! // ... wire `probes` handlers to the syscall hooks ...
//! probes.detach();
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`file_system_monitor`]: `unlink`/`unlinkat` and `open`/`openat` tracking,
//!   configured by the `[file-system-monitor]` section.

pub mod config;

use bpf_common::{BpfContext, BpfSender, ProgramError};
use file_system_monitor::{FsEvent, FsProbes, MODULE_NAME};
use syswatch_core::ConfigError;
use thiserror::Error;

pub use bpf_common;
pub use config::SyswatchConfig;
pub use file_system_monitor;
pub use syswatch_core;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid file-system-monitor configuration")]
    Config(#[from] ConfigError),
    #[error("attaching file-system-monitor failed")]
    Program(#[from] ProgramError),
}

/// Attach the file system probes, reading user memory and process metadata
/// of the calling thread.
pub fn attach<S: BpfSender<FsEvent>>(
    config: &SyswatchConfig,
    sender: S,
) -> Result<FsProbes<S>, AttachError> {
    let module_config = config.get_module_config(MODULE_NAME);
    let fs_config = file_system_monitor::Config::try_from(&module_config)?;
    let probes = file_system_monitor::program_with_config(BpfContext::default(), fs_config, sender)?;
    Ok(probes)
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder()
            .filter_level(level_filter)
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
