use std::collections::HashMap;
use std::path::{
    Path,
    PathBuf,
};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::models::forward_model::ForwardDefinition;
use crate::utils::error::ConfigError;

/// Persists the forward registry as a single JSON document:
/// `{"forwards": {"<name>": {...}}}`.
///
/// The store can be constructed without a backing path, in which case
/// saves are no-ops and loads return an empty registry.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// A store with persistence disabled.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the registry from disk. A missing file yields an empty
    /// registry; a file that is not a JSON object with a `forwards` map
    /// is a parse error. Individual entries that fail to deserialize or
    /// validate are logged and skipped, and the outer map key always
    /// wins over the entry's own `name`.
    pub async fn load(&self) -> Result<HashMap<String, ForwardDefinition>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(HashMap::new());
        };

        if !path.exists() {
            return Ok(HashMap::new());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        parse_forwards(&contents)
    }

    /// Writes the full registry to disk, creating the parent directory
    /// on demand and forcing the data out before returning.
    pub async fn save(
        &self, definitions: &HashMap<String, ForwardDefinition>,
    ) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let document = serde_json::json!({ "forwards": definitions });
        let contents = serde_json::to_string_pretty(&document)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;

        Ok(())
    }
}

/// Parses the `{"forwards": {...}}` document, leniently per entry.
pub fn parse_forwards(contents: &str) -> Result<HashMap<String, ForwardDefinition>, ConfigError> {
    let document: Value = serde_json::from_str(contents)?;
    let forwards = document
        .get("forwards")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ConfigError::Format("expected a top-level \"forwards\" object".to_string())
        })?;

    let mut definitions = HashMap::with_capacity(forwards.len());
    for (name, entry) in forwards {
        match serde_json::from_value::<ForwardDefinition>(entry.clone()) {
            Ok(mut definition) => {
                if definition.name() != name {
                    definition.set_name(name.clone());
                }
                match definition.validate() {
                    Ok(()) => {
                        definitions.insert(name.clone(), definition);
                    }
                    Err(e) => warn!(forward = %name, error = %e, "skipping invalid forward entry"),
                }
            }
            Err(e) => warn!(forward = %name, error = %e, "skipping malformed forward entry"),
        }
    }

    Ok(definitions)
}
