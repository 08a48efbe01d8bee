use crate::generation::GenerationMode;

use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: String,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Known models that lack the mode fall back to the first registered model
    /// that has it. Unknown identifiers pass through untouched.
    pub fn select(&self, requested: &str, mode: GenerationMode) -> Result<ModelSelection, String> {
        let capability = mode.as_str();
        if let Some(model) = self.registry.ensure(requested, capability) {
            return Ok(ModelSelection {
                model,
                requested: requested.to_string(),
                fallback_reason: None,
            });
        }
        if self.registry.get(requested).is_none() {
            return Ok(ModelSelection {
                model: ModelSpec::passthrough(requested, mode),
                requested: requested.to_string(),
                fallback_reason: None,
            });
        }

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!("No models available for mode '{capability}'."));
        };
        Ok(ModelSelection {
            model,
            requested: requested.to_string(),
            fallback_reason: Some(format!(
                "Requested model '{requested}' unavailable for mode '{capability}'."
            )),
        })
    }
}
