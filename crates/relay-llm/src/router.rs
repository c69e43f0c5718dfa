use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use relay_core::errors::ModelError;

use crate::backend::ModelBackend;

/// Maps agent model handles to backends. Resolution happens at invocation
/// time, so swapping a handle upgrades running sessions mid-flight.
pub struct ModelRouter {
    backends: RwLock<HashMap<String, Arc<dyn ModelBackend>>>,
    default_handle: String,
}

impl ModelRouter {
    pub fn new(default_handle: impl Into<String>) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            default_handle: default_handle.into(),
        }
    }

    /// Router with a single backend registered under "default".
    pub fn single(backend: Arc<dyn ModelBackend>) -> Self {
        let router = Self::new("default");
        router.register("default", backend);
        router
    }

    pub fn register(&self, handle: impl Into<String>, backend: Arc<dyn ModelBackend>) {
        self.backends.write().insert(handle.into(), backend);
    }

    /// Resolve a model handle; unknown handles fall back to the default.
    pub fn resolve(&self, handle: &str) -> Result<Arc<dyn ModelBackend>, ModelError> {
        let backends = self.backends.read();
        backends
            .get(handle)
            .or_else(|| backends.get(&self.default_handle))
            .cloned()
            .ok_or_else(|| {
                ModelError::InvalidRequest(format!(
                    "no backend for model handle '{handle}' and no default registered"
                ))
            })
    }

    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.backends.read().keys().cloned().collect();
        handles.sort();
        handles
    }
}
