pub mod models;
pub mod utils;

pub use models::forward_model::{
    ForwardDefinition,
    KubernetesForward,
    SocketForward,
    DEFAULT_GROUP,
};
pub use utils::config::ConfigStore;
pub use utils::config_dir::{
    get_config_dir,
    get_config_file_path,
    get_lock_file_path,
};
pub use utils::error::ConfigError;
pub use utils::lockfile::LockFile;
