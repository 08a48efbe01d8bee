mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_MODEL};
pub use selectors::{ModelSelection, ModelSelector};

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use crate::generation::GenerationMode;

    use super::{ModelRegistry, ModelSelector, ModelSpec};

    fn image_model(name: &str, capabilities: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            family: "stable-diffusion".to_string(),
            capabilities: capabilities.iter().map(|item| item.to_string()).collect(),
            default_steps: None,
        }
    }

    #[test]
    fn model_selector_falls_back_when_model_lacks_mode() {
        let mut models = IndexMap::new();
        models.insert(
            "txt-only".to_string(),
            image_model("txt-only", &["text-to-image"]),
        );
        models.insert(
            "both".to_string(),
            image_model("both", &["text-to-image", "image-to-image"]),
        );
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select("txt-only", GenerationMode::ImageToImage)
            .unwrap();
        assert_eq!(selection.model.name, "both");
        assert_eq!(selection.requested, "txt-only");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'txt-only' unavailable for mode 'image-to-image'.")
        );
    }

    #[test]
    fn model_selector_passes_unknown_identifiers_through() {
        let selection = ModelSelector::new(None)
            .select("my-finetune-v3", GenerationMode::ImageToImage)
            .unwrap();
        assert_eq!(selection.model.name, "my-finetune-v3");
        assert_eq!(selection.model.family, "remote");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn model_selector_errors_when_no_model_has_mode() {
        let mut models = IndexMap::new();
        models.insert(
            "txt-only".to_string(),
            image_model("txt-only", &["text-to-image"]),
        );
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select("txt-only", GenerationMode::ImageToImage)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for mode 'image-to-image'.");
    }
}
