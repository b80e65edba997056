use dashmap::DashMap;
use emberfhir_core::{CoreError, PathExpression};
use std::sync::Arc;

/// Tenant-wide cache of compiled search-parameter expressions, keyed
/// `"Type.name"`. Compilation happens at most once per key; concurrent
/// misses race harmlessly on the same source text.
#[derive(Debug, Default)]
pub struct PathCache {
    inner: DashMap<String, Arc<PathExpression>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &self,
        key: &str,
        expression: &str,
    ) -> Result<Arc<PathExpression>, CoreError> {
        if let Some(hit) = self.inner.get(key) {
            return Ok(hit.clone());
        }
        let compiled = Arc::new(PathExpression::compile(expression)?);
        self.inner.insert(key.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Drop a cached entry, e.g. when a SearchParameter is redefined.
    pub fn invalidate(&self, key: &str) {
        self.inner.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_once_and_reuses() {
        let cache = PathCache::new();
        let a = cache.get_or_compile("Patient.name", "Patient.name").unwrap();
        let b = cache.get_or_compile("Patient.name", "Patient.name").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalid_expressions_are_not_cached() {
        let cache = PathCache::new();
        assert!(cache.get_or_compile("Bad.expr", "a..b").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_forces_recompile() {
        let cache = PathCache::new();
        let a = cache.get_or_compile("Patient.name", "Patient.name").unwrap();
        cache.invalidate("Patient.name");
        let b = cache.get_or_compile("Patient.name", "Patient.name").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
