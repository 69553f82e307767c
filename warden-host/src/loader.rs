//! Intercepting loader
//!
//! The only way sandboxed code reaches a host module. Every key is
//! classified first:
//!
//! - unrestricted keys get the real module
//! - dangerous keys get the real module wrapped in the unit's
//!   [`CapabilityProxy`], after an up-front authorization when the rule asks
//!   for it
//!
//! The real module is always resolved before any prompt, so asking for a
//! module that does not exist fails with `ModuleNotFound` without bothering
//! the user.

use std::sync::Arc;

use crate::classifier::{is_path_key, CapabilityClassifier};
use crate::modules::HostModules;
use crate::proxy::CapabilityProxy;
use crate::value::{HostError, HostResult, Value};

/// Per-unit module resolver
#[derive(Debug, Clone)]
pub struct InterceptingLoader {
    classifier: Arc<CapabilityClassifier>,
    modules: Arc<HostModules>,
    proxy: Arc<CapabilityProxy>,
}

impl InterceptingLoader {
    pub fn new(
        classifier: Arc<CapabilityClassifier>,
        modules: Arc<HostModules>,
        proxy: Arc<CapabilityProxy>,
    ) -> Self {
        Self {
            classifier,
            modules,
            proxy,
        }
    }

    pub fn proxy(&self) -> &Arc<CapabilityProxy> {
        &self.proxy
    }

    pub fn classifier(&self) -> &Arc<CapabilityClassifier> {
        &self.classifier
    }

    pub fn modules(&self) -> &Arc<HostModules> {
        &self.modules
    }

    /// Resolve `key` to the implementation this unit may see
    pub fn resolve(&self, key: &str) -> HostResult {
        let Some(request) = self.classifier.classify(key) else {
            let key = self.classifier.normalize(key);
            tracing::trace!(unit = %self.proxy.unit_id(), module = %key, "Unrestricted module");
            return self.modules.resolve(key);
        };

        let real = self.modules.resolve(&request.resource_key)?;

        if request.authorize_on_load {
            self.proxy.authorize(&request, real.as_object())?;
        }

        tracing::debug!(
            unit = %self.proxy.unit_id(),
            resource = %request.resource_key,
            category = %request.category,
            "Gating dangerous module"
        );
        let path = request.resource_key.clone();
        Ok(self.proxy.wrap(real, &request, &path))
    }

    /// Resolved name of `key` without loading it
    pub fn resolve_name(&self, key: &str) -> HostResult<String> {
        resolve_name(&self.classifier, &self.modules, key)
    }
}

/// What `require.resolve` reports: the module name, or the absolute file
/// path for path-shaped keys
pub fn resolve_name(
    classifier: &CapabilityClassifier,
    modules: &HostModules,
    key: &str,
) -> HostResult<String> {
    let key = classifier.normalize(key);
    if is_path_key(key) {
        return Ok(modules.resolve_path(key).to_string_lossy().into_owned());
    }
    if modules.contains(key) {
        Ok(key.to_string())
    } else {
        Err(HostError::ModuleNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullAuditSink;
    use crate::classifier::DangerTable;
    use crate::trust::{ConsentResponse, MemoryTrustStore, RecordingPrompt, TrustBroker};
    use warden_api::CodeHash;

    fn loader_with(response: ConsentResponse) -> (InterceptingLoader, Arc<RecordingPrompt>) {
        let prompt = Arc::new(RecordingPrompt::new(response));
        let broker = Arc::new(TrustBroker::new(
            Arc::new(MemoryTrustStore::new()),
            prompt.clone(),
            Arc::new(NullAuditSink),
        ));
        let proxy = CapabilityProxy::new("unit", CodeHash::of("src"), broker);
        let loader = InterceptingLoader::new(
            Arc::new(CapabilityClassifier::new(DangerTable::builtin())),
            Arc::new(HostModules::builtin(std::env::temp_dir())),
            proxy,
        );
        (loader, prompt)
    }

    #[test]
    fn test_unrestricted_module_is_real() {
        let (loader, prompt) = loader_with(ConsentResponse::Deny);
        let path = loader.resolve("node:path").unwrap();
        let real = loader.modules().resolve("path").unwrap();
        assert!(path.same(&real));
        assert_eq!(prompt.prompt_count(), 0);
    }

    #[test]
    fn test_dangerous_module_is_gated_lazily() {
        let (loader, prompt) = loader_with(ConsentResponse::Deny);
        let fs = loader.resolve("fs").unwrap();
        assert!(loader.proxy().is_gated(fs.as_object().unwrap()));
        assert_eq!(prompt.prompt_count(), 0);

        // same key, same proxy
        assert!(fs.same(&loader.resolve("node:fs").unwrap()));
    }

    #[test]
    fn test_on_load_rule_authorizes_at_resolution() {
        let (loader, prompt) = loader_with(ConsentResponse::Deny);
        let err = loader.resolve("WebAssembly").unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(prompt.prompt_count(), 1);
    }

    #[test]
    fn test_process_is_authorized_before_its_environment_is_reachable() {
        let (loader, prompt) = loader_with(ConsentResponse::Deny);
        let err = loader.resolve("node:process").unwrap_err();
        assert!(err.is_access_denied());
        assert_eq!(prompt.prompt_count(), 1);
        assert_eq!(prompt.prompts()[0].resource_key, "process");
    }

    #[test]
    fn test_missing_module_fails_before_prompt() {
        let (loader, prompt) = loader_with(ConsentResponse::Allow);
        let err = loader.resolve("vm").unwrap_err();
        assert!(matches!(err, HostError::ModuleNotFound(_)));
        assert_eq!(prompt.prompt_count(), 0);
    }

    #[test]
    fn test_resolve_name() {
        let (loader, _) = loader_with(ConsentResponse::Deny);
        assert_eq!(loader.resolve_name("node:fs").unwrap(), "fs");
        assert!(loader.resolve_name("leftpad").is_err());
        assert!(loader.resolve_name("./x.json").unwrap().ends_with("x.json"));
    }
}
