//! Display-only record of which handle resolved to which channel identifier.
//! Never read on the polling path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::store::{read_json_with_tmp_fallback, write_atomic, OrderedMap};

pub const HANDLES_FILE: &str = "handles.json";

#[derive(Debug, Clone)]
pub struct HandleBook {
    inner: Arc<Mutex<Vec<(String, String)>>>,
    path: Option<PathBuf>,
}

impl HandleBook {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            path: None,
        }
    }

    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(HANDLES_FILE);
        let entries = match read_json_with_tmp_fallback::<OrderedMap<String>>(&path).await {
            Ok(Some(map)) => map.0,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "starting with an empty handle book");
                Vec::new()
            }
        };
        Self {
            inner: Arc::new(Mutex::new(entries)),
            path: Some(path),
        }
    }

    pub async fn lookup(&self, handle: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(handle))
            .map(|(_, id)| id.clone())
    }

    /// Records `handle -> id`, replacing an earlier resolution of the same handle.
    pub async fn record(&self, handle: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.iter_mut().find(|(h, _)| h.eq_ignore_ascii_case(handle)) {
            Some((_, existing)) if existing == id => return Ok(()),
            Some((_, existing)) => *existing = id.to_owned(),
            None => inner.push((handle.to_owned(), id.to_owned())),
        }
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&OrderedMap(inner.clone()))?;
            write_atomic(path, &bytes).await?;
        }
        Ok(())
    }
}
