use std::fs;
use std::path::PathBuf;

use sysinfo::{
    Pid,
    System,
};
use tracing::{
    info,
    warn,
};

use crate::utils::config_dir::get_lock_file_path;
use crate::utils::error::ConfigError;

/// PID lock guarding a daemon listen port. Removed on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock for the given RPC port.
    ///
    /// Refuses when the file names a live process whose name contains
    /// `kubeportal`; a stale or foreign PID is overwritten.
    pub fn acquire(port: u16) -> Result<Self, ConfigError> {
        let path = get_lock_file_path(port)?;
        Self::acquire_at(path)
    }

    pub fn acquire_at(path: PathBuf) -> Result<Self, ConfigError> {
        if let Some(pid) = read_pid(&path) {
            if is_live_daemon(pid) {
                return Err(ConfigError::Locked { pid, path });
            }
            warn!(pid, path = %path.display(), "removing stale lock file");
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, std::process::id().to_string())?;
        info!(path = %path.display(), "acquired daemon lock");

        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

fn read_pid(path: &PathBuf) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<u32>().ok()
}

fn is_live_daemon(pid: u32) -> bool {
    if pid == std::process::id() {
        return false;
    }

    let system = System::new_all();
    system
        .process(Pid::from_u32(pid))
        .map(|process| {
            process
                .name()
                .to_string_lossy()
                .to_lowercase()
                .contains("kubeportal")
        })
        .unwrap_or(false)
}
