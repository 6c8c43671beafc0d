//! Component C: the process-wide table of `ModuleProxy`s.
//!
//! Mirrors `original_source/.../realmfuzzer/engine/module-pool.cc`: one proxy per
//! `(module_id, size)` pair, shared across every process that has that module loaded, so
//! coverage accumulates globally rather than per-process. A mismatched size for an
//! already-known module id is a caller bug (the module changed shape without a version
//! bump) and is rejected rather than silently re-keyed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::coverage::module_proxy::{ModuleId, ModuleProxy};
use crate::error::{Error, Result};

/// Indexes every `ModuleProxy` currently tracked, by module identity.
#[derive(Default)]
pub struct ModulePool {
    modules: Mutex<HashMap<ModuleId, Arc<Mutex<ModuleProxy>>>>,
}

impl ModulePool {
    pub fn new() -> Self {
        ModulePool {
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the proxy for `(id, size)`, creating it on first use. Returns
    /// `Error::InvalidArgument` if `id` is already known under a different size.
    pub fn get(&self, id: ModuleId, size: usize) -> Result<Arc<Mutex<ModuleProxy>>> {
        let mut modules = self.modules.lock().unwrap();
        if let Some(proxy) = modules.get(&id) {
            let existing_size = proxy.lock().unwrap().size();
            if existing_size != size {
                return Err(Error::InvalidArgument(format!(
                    "module {id:?} re-registered with size {size}, expected {existing_size}"
                )));
            }
            return Ok(Arc::clone(proxy));
        }
        let proxy = Arc::new(Mutex::new(ModuleProxy::new(id, size)));
        modules.insert(id, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Number of distinct modules currently tracked.
    pub fn len(&self) -> usize {
        self.modules.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `measure` on every tracked module and sums the new-feature counts.
    pub fn measure_all(&self) -> usize {
        let modules = self.modules.lock().unwrap();
        modules.values().map(|p| p.lock().unwrap().measure()).sum()
    }

    /// Runs `accumulate` on every tracked module and sums the new-feature counts.
    pub fn accumulate_all(&self) -> usize {
        let modules = self.modules.lock().unwrap();
        modules.values().map(|p| p.lock().unwrap().accumulate()).sum()
    }

    /// Sums `get_coverage` across every tracked module: `(total_pcs, total_features)`.
    pub fn get_coverage(&self) -> (usize, usize) {
        let modules = self.modules.lock().unwrap();
        modules.values().fold((0, 0), |(pcs, features), p| {
            let (p_pcs, p_features) = p.lock().unwrap().get_coverage();
            (pcs + p_pcs, features + p_features)
        })
    }

    /// Clears accumulated features on every tracked module.
    pub fn clear(&self) {
        let modules = self.modules.lock().unwrap();
        for proxy in modules.values() {
            proxy.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_proxy_for_same_identity() {
        let pool = ModulePool::new();
        let a = pool.get([1, 2], 16).unwrap();
        let b = pool.get([1, 2], 16).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_size_mismatch() {
        let pool = ModulePool::new();
        pool.get([1, 2], 16).unwrap();
        let err = pool.get([1, 2], 8).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn distinct_identities_get_distinct_proxies() {
        let pool = ModulePool::new();
        pool.get([1, 2], 16).unwrap();
        pool.get([3, 4], 8).unwrap();
        assert_eq!(pool.len(), 2);
    }
}
