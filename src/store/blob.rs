//! Object-storage discovery backend.
//!
//! Datasets live under `<instrument>/<project>/<leaf>/...` in a blob
//! container; listing collapses raw object keys down to their three-segment
//! dataset prefixes. Write traffic goes through the versioned store, never
//! through this lister.

use crate::error::{Result, StreamError};
use crate::store::PathLister;
use async_trait::async_trait;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct BlobLister {
    store: Arc<dyn ObjectStore>,
}

impl BlobLister {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PathLister for BlobLister {
    async fn list_paths(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = ObjectPath::from(prefix.trim_end_matches('/'));
        let mut stream = self.store.list(Some(&prefix_path));
        let mut datasets = BTreeSet::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| StreamError::BackendUnreachable(e.to_string()))?;
            let parts: Vec<String> = meta
                .location
                .parts()
                .take(3)
                .map(|p| p.as_ref().to_string())
                .collect();
            if parts.len() == 3 {
                datasets.insert(parts.join("/"));
            }
        }
        Ok(datasets.into_iter().collect())
    }
}
