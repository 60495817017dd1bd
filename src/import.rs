//! Deduplicated disk-image import queue.
//!
//! "Import" means: make a source image available under a template id with
//! the hypervisor. Remote sources are downloaded to a private temporary
//! file first. The invariant is one fetch per distinct source URL per
//! process lifetime: a second request for an in-flight URL waits for the
//! first and then short-circuits, so concurrent boot pipelines sharing a
//! template never duplicate the download.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::download;
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;

/// Per-URL import state: locked while a fetch is in flight, `true` once
/// the URL has been imported in this process.
type UrlSlot = Arc<Mutex<bool>>;

pub struct ImportQueue {
    executor: CommandExecutor,
    base_dir: PathBuf,
    http: reqwest::Client,
    slots: Mutex<HashMap<String, UrlSlot>>,
}

impl ImportQueue {
    pub fn new(executor: CommandExecutor, base_dir: PathBuf) -> Self {
        Self {
            executor,
            base_dir,
            http: reqwest::Client::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch `source_url` and register it under `vm_id`, deduplicating by
    /// source URL.
    pub async fn import(&self, source_url: &str, vm_id: &str) -> Result<()> {
        let slot = self.slot_for(source_url).await;
        let mut done = slot.lock().await;

        if *done {
            debug!(url = %source_url, "source already imported, skipping fetch");
            return Ok(());
        }

        self.perform(source_url, vm_id).await?;
        *done = true;

        Ok(())
    }

    async fn slot_for(&self, source_url: &str) -> UrlSlot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(source_url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(false)))
            .clone()
    }

    async fn perform(&self, source_url: &str, vm_id: &str) -> Result<()> {
        info!(url = %source_url, vm_id = %vm_id, "importing image");

        match split_scheme(source_url) {
            Some(("file", rest)) => {
                let path = {
                    let raw = PathBuf::from(rest);
                    if raw.is_absolute() {
                        raw
                    } else {
                        self.base_dir.join(raw)
                    }
                };
                self.register(&path, vm_id, source_url).await
            }
            Some(("http" | "https", _)) => {
                let local = temp_download_path(source_url);

                if let Err(e) = download::get(&self.http, source_url, &local).await {
                    remove_best_effort(&local).await;
                    return Err(e);
                }

                let result = self.register(&local, vm_id, source_url).await;
                remove_best_effort(&local).await;
                result
            }
            _ => Err(Error::user(format!(
                "unsupported scheme for url {source_url:?}"
            ))),
        }
    }

    async fn register(&self, path: &PathBuf, vm_id: &str, source_url: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        let output = self
            .executor
            .execute(&["import", &path_str, "--vsys", "0", "--vmname", vm_id])
            .await?;

        if !output.success() {
            return Err(Error::consistency(format!(
                "cannot import {source_url:?} with name {vm_id:?}"
            )));
        }

        Ok(())
    }
}

fn split_scheme(url: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    Some((scheme, rest))
}

fn temp_download_path(source_url: &str) -> PathBuf {
    let basename = source_url.rsplit('/').next().unwrap_or("image");
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    std::env::temp_dir().join(format!("{stamp}-{basename}"))
}

async fn remove_best_effort(path: &PathBuf) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        // A fetch that failed before creating the file leaves nothing
        // to clean up.
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "cannot remove temporary download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_splitting() {
        assert_eq!(split_scheme("http://x/y.ova"), Some(("http", "x/y.ova")));
        assert_eq!(split_scheme("file:///a/b.ova"), Some(("file", "/a/b.ova")));
        assert_eq!(split_scheme("no-scheme-here"), None);
    }

    #[test]
    fn temp_paths_keep_the_basename() {
        let path = temp_download_path("https://images.example.com/base.ova");
        assert!(path.to_string_lossy().ends_with("-base.ova"));
    }
}
