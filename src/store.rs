//! # Feature: Config Store
//!
//! File-backed JSON documents, one per feature, under the configs directory:
//!
//! ```text
//! configs/<name>.json                    live document, edited by the dashboard
//! configs/schemas/<name>.schema.json     JSON Schema, must exist for <name> to be served
//! configs/defaults/<name>.json           seed used when the live document is missing
//! configs/applied_configs/<name>.json    last applied snapshot, used for diffing
//! ```
//!
//! Missing or malformed documents read as `{}` at this layer.

use anyhow::{Context, Result};
use jsonschema::JSONSchema;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;

static CONFIG_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid regex"));

/// Shared schema fragments; never materialised as a live document
const DEFINITIONS: &str = "definitions";

/// Paths of a config that exists (its schema is present)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFiles {
    pub config: PathBuf,
    pub schema: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_valid_name(name: &str) -> bool {
        CONFIG_NAME_PATTERN.is_match(name)
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    pub fn applied_path(&self, name: &str) -> PathBuf {
        self.root.join("applied_configs").join(format!("{}.json", name))
    }

    pub fn schema_path(&self, name: &str) -> PathBuf {
        self.root.join("schemas").join(format!("{}.schema.json", name))
    }

    pub fn default_path(&self, name: &str) -> PathBuf {
        self.root.join("defaults").join(format!("{}.json", name))
    }

    /// Map a config name to its files.
    ///
    /// Returns `None` when the name is malformed or has no schema. A missing
    /// live document is created from the defaults file, or `{}`.
    pub async fn resolve(&self, name: &str) -> Result<Option<ConfigFiles>> {
        if !Self::is_valid_name(name) {
            debug!("Rejecting config name '{}'", name);
            return Ok(None);
        }

        let schema = self.schema_path(name);
        if !fs::try_exists(&schema).await.unwrap_or(false) {
            return Ok(None);
        }

        let config = self.config_path(name);
        if name != DEFINITIONS && !fs::try_exists(&config).await.unwrap_or(false) {
            let default_path = self.default_path(name);
            let default = if fs::try_exists(&default_path).await.unwrap_or(false) {
                read_json_or_empty(&default_path).await
            } else {
                Value::Object(Default::default())
            };
            debug!("Creating {} from defaults", config.display());
            write_json(&config, &default).await?;
        }

        Ok(Some(ConfigFiles { config, schema }))
    }

    /// Live document, `{}` when missing or malformed
    pub async fn read_document(&self, name: &str) -> Value {
        read_json_or_empty(&self.config_path(name)).await
    }

    /// Live document, failing on malformed JSON instead of defaulting
    pub async fn read_document_strict(&self, name: &str) -> Result<Value> {
        let path = self.config_path(name);
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Last applied snapshot, `{}` when nothing was applied yet
    pub async fn read_applied(&self, name: &str) -> Value {
        read_json_or_empty(&self.applied_path(name)).await
    }

    pub async fn read_schema(&self, name: &str) -> Result<Value> {
        let path = self.schema_path(name);
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read schema {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse schema {}", path.display()))
    }

    pub async fn write_document(&self, name: &str, document: &Value) -> Result<()> {
        write_json(&self.config_path(name), document).await
    }

    /// Persist the live document and the snapshot of what was published
    pub async fn persist_applied(&self, name: &str, document: &Value, applied: &Value) -> Result<()> {
        write_json(&self.config_path(name), document).await?;
        write_json(&self.applied_path(name), applied).await
    }
}

/// Validate a document against a JSON Schema, collecting every violation
pub fn validate_against_schema(schema: &Value, document: &Value) -> Result<(), Vec<String>> {
    let compiled = JSONSchema::compile(schema).map_err(|e| vec![format!("Invalid schema: {}", e)])?;
    let result = compiled.validate(document);
    match result {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect()),
    }
}

async fn read_json_or_empty(path: &Path) -> Value {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(_) => return Value::Object(Default::default()),
    };
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Malformed JSON in {}: {}", path.display(), e);
            Value::Object(Default::default())
        }
    }
}

async fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store_with_schema(name: &str, schema: Value) -> (TempDir, ConfigStore) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        write_json(&store.schema_path(name), &schema).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_resolve_requires_schema() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.resolve("role_buttons").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_rejects_path_traversal() {
        let (_dir, store) = store_with_schema("role_buttons", json!({})).await;
        assert!(store.resolve("../role_buttons").await.unwrap().is_none());
        assert!(store.resolve("role buttons").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_creates_config_from_defaults() {
        let (_dir, store) = store_with_schema("role_buttons", json!({"type": "object"})).await;
        write_json(&store.default_path("role_buttons"), &json!({"channels": []}))
            .await
            .unwrap();

        let files = store.resolve("role_buttons").await.unwrap().unwrap();
        assert_eq!(files.config, store.config_path("role_buttons"));
        assert_eq!(store.read_document("role_buttons").await, json!({"channels": []}));
    }

    #[tokio::test]
    async fn test_resolve_creates_empty_config_without_defaults() {
        let (_dir, store) = store_with_schema("embed_message", json!({})).await;
        store.resolve("embed_message").await.unwrap().unwrap();
        assert_eq!(store.read_document("embed_message").await, json!({}));
    }

    #[tokio::test]
    async fn test_resolve_does_not_materialise_definitions() {
        let (_dir, store) = store_with_schema("definitions", json!({})).await;
        store.resolve("definitions").await.unwrap().unwrap();
        assert!(!store.config_path("definitions").exists());
    }

    #[tokio::test]
    async fn test_resolve_keeps_existing_config() {
        let (_dir, store) = store_with_schema("role_buttons", json!({})).await;
        write_json(&store.default_path("role_buttons"), &json!({"channels": []}))
            .await
            .unwrap();
        store
            .write_document("role_buttons", &json!({"channels": [{"id": "1"}]}))
            .await
            .unwrap();

        store.resolve("role_buttons").await.unwrap().unwrap();
        assert_eq!(
            store.read_document("role_buttons").await,
            json!({"channels": [{"id": "1"}]})
        );
    }

    #[tokio::test]
    async fn test_malformed_document_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        fs::write(store.config_path("broken"), "{ not json").await.unwrap();

        assert_eq!(store.read_document("broken").await, json!({}));
        assert!(store.read_document_strict("broken").await.is_err());
        assert_eq!(store.read_applied("broken").await, json!({}));
    }

    #[tokio::test]
    async fn test_persist_applied_writes_both_copies() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let doc = json!({"channels": [{"id": "1", "groups": []}]});
        let applied = json!({"channels": []});

        store.persist_applied("embed_message", &doc, &applied).await.unwrap();

        assert_eq!(store.read_document("embed_message").await, doc);
        assert_eq!(store.read_applied("embed_message").await, applied);
    }

    #[test]
    fn test_validate_against_schema() {
        let schema = json!({
            "type": "object",
            "required": ["channels"],
            "properties": {"channels": {"type": "array"}}
        });

        assert!(validate_against_schema(&schema, &json!({"channels": []})).is_ok());

        let errors = validate_against_schema(&schema, &json!({"channels": "nope"})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("/channels"));

        assert!(validate_against_schema(&schema, &json!({})).is_err());
    }
}
