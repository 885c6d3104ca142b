use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::Semaphore;

use super::{ApiError, LayoutApi, LayoutDocument, UpdateLayoutRequest};
use crate::layout::model::Layout;
use crate::resolver::UiAssociations;

#[derive(Debug, Default)]
struct Store {
    layouts: HashMap<String, LayoutDocument>,
    associations: HashMap<String, UiAssociations>,
    patches: HashMap<String, Value>,
    fail_loads: bool,
    fail_saves: bool,
    fail_patches: bool,
    saves: usize,
}

/// In-process [`LayoutApi`] for offline hosts and tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryLayoutApi {
    store: Arc<Mutex<Store>>,
    patch_gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl MemoryLayoutApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a patch: its exported document and upload-time associations.
    pub fn insert_patch(&self, patch_id: &str, document: Value, associations: UiAssociations) {
        let mut store = self.store();
        store.patches.insert(patch_id.to_string(), document);
        store
            .associations
            .insert(patch_id.to_string(), associations);
    }

    pub fn insert_layout(&self, patch_id: &str, document: LayoutDocument) {
        self.store()
            .layouts
            .insert(patch_id.to_string(), document);
    }

    pub fn layout(&self, patch_id: &str) -> Option<LayoutDocument> {
        self.store().layouts.get(patch_id).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.store().saves
    }

    /// Make every layout and association fetch fail until reset.
    pub fn fail_loads(&self, fail: bool) {
        self.store().fail_loads = fail;
    }

    pub fn fail_saves(&self, fail: bool) {
        self.store().fail_saves = fail;
    }

    /// Make `fetch_patch` fail while layouts and associations still load.
    pub fn fail_patch_fetches(&self, fail: bool) {
        self.store().fail_patches = fail;
    }

    /// Hold `fetch_patch` calls until [`release_patch_fetches`] is called.
    ///
    /// [`release_patch_fetches`]: Self::release_patch_fetches
    pub fn hold_patch_fetches(&self) {
        if let Ok(mut gate) = self.patch_gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn release_patch_fetches(&self) {
        if let Ok(mut gate) = self.patch_gate.lock() {
            if let Some(semaphore) = gate.take() {
                semaphore.close();
            }
        }
    }

    fn check_loads(&self) -> Result<(), ApiError> {
        if self.store().fail_loads {
            Err(ApiError::Unavailable("layout store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl LayoutApi for MemoryLayoutApi {
    async fn fetch_layout(&self, patch_id: &str) -> Result<Option<LayoutDocument>, ApiError> {
        self.check_loads()?;
        Ok(self.store().layouts.get(patch_id).cloned())
    }

    async fn update_layout(
        &self,
        patch_id: &str,
        request: &UpdateLayoutRequest,
    ) -> Result<(), ApiError> {
        let layout = Layout::new(patch_id, request.layout.clone())
            .with_columns(request.num_columns)
            .with_labels(request.show_label);
        let document =
            LayoutDocument::from_layout(&layout).map_err(|err| ApiError::Decode(err.to_string()))?;
        let mut store = self.store();
        if store.fail_saves {
            return Err(ApiError::Unavailable("layout store offline".into()));
        }
        if !store.patches.contains_key(patch_id) {
            return Err(ApiError::NotFound(patch_id.to_string()));
        }
        store.layouts.insert(patch_id.to_string(), document);
        store.saves += 1;
        Ok(())
    }

    async fn fetch_ui_associations(
        &self,
        patch_id: &str,
    ) -> Result<Option<UiAssociations>, ApiError> {
        self.check_loads()?;
        Ok(self.store().associations.get(patch_id).cloned())
    }

    async fn fetch_patch(&self, patch_id: &str) -> Result<Option<Value>, ApiError> {
        let gate = self
            .patch_gate
            .lock()
            .ok()
            .and_then(|gate| gate.as_ref().map(Arc::clone));
        if let Some(semaphore) = gate {
            // Closing the semaphore is the release signal.
            let _ = semaphore.acquire().await;
        }
        let store = self.store();
        if store.fail_patches {
            return Err(ApiError::Unavailable("patch store offline".into()));
        }
        Ok(store.patches.get(patch_id).cloned())
    }
}
