use crate::resource::Resource;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves reference literals into resources, dispatching into the
/// tenant's stores. Implemented by the tenant engine.
pub trait ElementResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<Resource>;
}

/// Answers value-set membership questions for token search modifiers.
pub trait TerminologyService: Send + Sync {
    fn value_set_contains(&self, value_set_url: &str, system: Option<&str>, code: &str) -> bool;
}

/// Evaluation context threaded through path expressions and search tests.
///
/// Carries named variables (`%current`, `%previous`, ...) plus the optional
/// resolver and terminology collaborators.
#[derive(Clone, Default)]
pub struct EvalContext {
    vars: HashMap<String, Value>,
    resolver: Option<Arc<dyn ElementResolver>>,
    terminology: Option<Arc<dyn TerminologyService>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ElementResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_terminology(mut self, terminology: Arc<dyn TerminologyService>) -> Self {
        self.terminology = Some(terminology);
        self
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn resolver(&self) -> Option<&Arc<dyn ElementResolver>> {
        self.resolver.as_ref()
    }

    pub fn terminology(&self) -> Option<&Arc<dyn TerminologyService>> {
        self.terminology.as_ref()
    }
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("vars", &self.vars.keys().collect::<Vec<_>>())
            .field("resolver", &self.resolver.is_some())
            .field("terminology", &self.terminology.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variables_round_trip() {
        let ctx = EvalContext::new().with_var("current", json!({"resourceType": "Patient"}));
        assert!(ctx.var("current").is_some());
        assert!(ctx.var("previous").is_none());
    }

    #[test]
    fn collaborators_default_absent() {
        let ctx = EvalContext::new();
        assert!(ctx.resolver().is_none());
        assert!(ctx.terminology().is_none());
    }
}
