use std::env;
use std::path::PathBuf;

use crate::utils::error::ConfigError;

/// Resolves the per-user KubePortal data directory.
///
/// `KUBEPORTAL_CONFIG` overrides everything; otherwise the platform
/// convention applies: `%LOCALAPPDATA%\KubePortal` on Windows,
/// `~/Library/Application Support/KubePortal` on macOS and
/// `~/.kubeportal` elsewhere.
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(config_dir) = env::var("KUBEPORTAL_CONFIG") {
        return Ok(PathBuf::from(config_dir));
    }

    if cfg!(target_os = "windows") {
        if let Some(mut path) = dirs::data_local_dir() {
            path.push("KubePortal");
            return Ok(path);
        }
    } else if cfg!(target_os = "macos") {
        if let Some(mut path) = dirs::data_dir() {
            path.push("KubePortal");
            return Ok(path);
        }
    } else if let Some(mut path) = dirs::home_dir() {
        path.push(".kubeportal");
        return Ok(path);
    }

    Err(ConfigError::Path(
        "unable to determine the configuration directory".to_string(),
    ))
}

pub fn get_config_file_path() -> Result<PathBuf, ConfigError> {
    let mut path = get_config_dir()?;
    path.push("config.json");
    Ok(path)
}

pub fn get_lock_file_path(port: u16) -> Result<PathBuf, ConfigError> {
    let mut path = get_config_dir()?;
    path.push(format!("kubeportal-{port}.lock"));
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: String,
        original_value: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &str, value: &str) -> Self {
            let key = key.to_string();
            let original_value = env::var(&key).ok();
            env::set_var(&key, value);
            EnvVarGuard {
                key,
                original_value,
            }
        }

        fn remove(key: &str) -> Self {
            let key = key.to_string();
            let original_value = env::var(&key).ok();
            env::remove_var(&key);
            EnvVarGuard {
                key,
                original_value,
            }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.original_value {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_config_dir_env_override() {
        let _lock = ENV_TEST_MUTEX.lock().unwrap();
        let _guard = EnvVarGuard::set("KUBEPORTAL_CONFIG", "/custom/config/dir");
        assert_eq!(
            get_config_dir().unwrap(),
            PathBuf::from("/custom/config/dir")
        );
        assert_eq!(
            get_config_file_path().unwrap(),
            PathBuf::from("/custom/config/dir/config.json")
        );
    }

    #[test]
    fn test_lock_file_path_embeds_port() {
        let _lock = ENV_TEST_MUTEX.lock().unwrap();
        let _guard = EnvVarGuard::set("KUBEPORTAL_CONFIG", "/custom/config/dir");
        assert_eq!(
            get_lock_file_path(50051).unwrap(),
            PathBuf::from("/custom/config/dir/kubeportal-50051.lock")
        );
    }

    #[test]
    fn test_config_dir_platform_default() {
        let _lock = ENV_TEST_MUTEX.lock().unwrap();
        let _guard = EnvVarGuard::remove("KUBEPORTAL_CONFIG");
        let dir = get_config_dir().unwrap();
        if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
            assert!(dir.ends_with("KubePortal"));
        } else {
            assert!(dir.ends_with(".kubeportal"));
        }
    }
}
