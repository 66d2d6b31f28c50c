use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid forward definition: {0}")]
    Validation(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config format error: {0}")]
    Format(String),

    #[error("unable to resolve path: {0}")]
    Path(String),

    #[error("another kubeportal daemon (pid {pid}) already holds {path}")]
    Locked { pid: u32, path: PathBuf },
}
