//! Command execution against a store group
//!
//! Every command waits for the initial read first. `set` goes through the
//! key's store and waits for the flushed batch to be written; `remove` has
//! no store-level counterpart and goes to the area directly.

use std::path::Path;
use std::sync::Arc;
use syncstores::storage::settle;
use syncstores::{
    AdapterConfig, StorageAdapter, StorageArea, StorageNamespace, Store, StoreGroup,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::args::Command;
use crate::error::CliError;

/// Read adapter options from a JSON file
///
/// # Errors
/// Returns `Config` if the file can't be read or parsed.
pub fn load_config(path: &Path) -> Result<AdapterConfig, CliError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
    AdapterConfig::from_json(&text).map_err(|e| CliError::Config(format!("{}: {e}", path.display())))
}

/// Register `area` under the configured name and open a store group on it
///
/// # Errors
/// Returns the adapter's setup error.
pub fn open_group(
    area: Arc<dyn StorageArea>,
    config: &AdapterConfig,
) -> Result<StoreGroup, CliError> {
    let mut namespace = StorageNamespace::new();
    namespace.insert(&config.area, area);
    let group = StorageAdapter::from_config(Arc::new(namespace), config).open(config.keys.clone())?;
    Ok(group)
}

fn store(group: &StoreGroup, key: &str) -> Result<Store, CliError> {
    group
        .store(key)
        .ok_or_else(|| CliError::UnknownKey(key.to_string()))
}

/// Run one command, returning the lines to print
///
/// # Errors
/// Returns the first failure: the initial read, a malformed value, an
/// unknown key or the write itself.
pub async fn execute(
    command: &Command,
    group: &StoreGroup,
    area: &dyn StorageArea,
) -> Result<Vec<String>, CliError> {
    group.ready().await?;

    match command {
        Command::Get { key } => {
            let value = store(group, key)?.get();
            Ok(value.map(|v| v.to_string()).into_iter().collect())
        }
        Command::Set { key, value } => {
            let value = serde_json::from_str(value).map_err(CliError::Value)?;
            let store = store(group, key)?;

            let (tx, mut rx) = mpsc::unbounded_channel();
            let _observer = group.on_write(move |handle, batch| {
                debug!(keys = batch.len(), "batch flushed");
                let _ = tx.send(handle);
            });
            store.set(value);

            let handle = rx
                .recv()
                .await
                .ok_or(syncstores::StorageError::Disconnected)?;
            handle.await?;
            info!(key = %key, "value written");
            Ok(Vec::new())
        }
        Command::Remove { key } => {
            let result = area.remove(key).await;
            settle(result, area)?;
            info!(key = %key, "value removed");
            Ok(Vec::new())
        }
        Command::List => {
            let lines = group
                .stores()
                .keys()
                .into_iter()
                .filter_map(|key| {
                    let value = group.store(&key)?.get()?;
                    Some(format!("{key}\t{value}"))
                })
                .collect();
            Ok(lines)
        }
    }
}
