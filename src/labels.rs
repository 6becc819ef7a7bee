use std::{collections::HashMap, fs, path::Path};

use tracing::info;

use crate::error::{Error, Result};

/// Class key (as written in the JSON file) to display name.
#[derive(Debug, Clone, Default)]
pub struct LabelStore {
    names: HashMap<String, String>,
}

impl LabelStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(Error::LabelExtension(path.to_path_buf()));
        }

        let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let store = Self::from_json(&raw)?;
        info!("Loaded {} labels from {}", store.len(), path.display());
        Ok(store)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let names: HashMap<String, String> = serde_json::from_str(raw)?;
        Ok(Self { names })
    }

    pub fn name(&self, key: &str) -> Option<&str> {
        self.names.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.names.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

impl FromIterator<(String, String)> for LabelStore {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}
