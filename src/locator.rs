//! Discovery of candidate remote datasets under an instrument/project prefix.
//!
//! Listing is delegated to the backend; entries that fail to decode are
//! logged and dropped, never fatal. Backend listing failures propagate as
//! `BackendUnreachable` without another retry layer here; the backend's own
//! retry policy has already run.

use crate::error::Result;
use crate::path::DatasetRef;
use crate::store::PathLister;
use tracing::debug;

pub struct RepositoryLocator<'a> {
    lister: &'a dyn PathLister,
}

impl<'a> RepositoryLocator<'a> {
    pub fn new(lister: &'a dyn PathLister) -> Self {
        Self { lister }
    }

    /// All decodable dataset refs under `prefix`, sorted strictly descending
    /// by creation timestamp (ties by profile, then lexical path).
    pub async fn find_candidates(&self, prefix: &str) -> Result<Vec<DatasetRef>> {
        let raw = self.lister.list_paths(prefix).await?;
        let mut refs: Vec<DatasetRef> = raw
            .iter()
            .filter_map(|path| match DatasetRef::decode(path) {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!(%path, error = %e, "skipping undecodable entry");
                    None
                }
            })
            .collect();
        // Newest first; ties broken by profile (l1b before l1bmin), then
        // lexical path.
        refs.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then(a.profile.cmp(&b.profile))
                .then_with(|| a.encode().cmp(&b.encode()))
        });
        Ok(refs)
    }

    /// The most recent dataset under `prefix`, or `None` when nothing
    /// decodable exists (signals "no prior dataset, must create").
    pub async fn latest(&self, prefix: &str) -> Result<Option<DatasetRef>> {
        Ok(self.find_candidates(prefix).await?.into_iter().next())
    }
}
