use indexmap::IndexMap;

use crate::generation::GenerationMode;

pub const DEFAULT_MODEL: &str = "sd-v1-5";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub family: String,
    pub capabilities: Vec<String>,
    pub default_steps: Option<u32>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    pub fn supports_mode(&self, mode: GenerationMode) -> bool {
        self.supports(mode.as_str())
    }

    /// Spec for an identifier the registry does not know; the service decides what it means.
    pub fn passthrough(name: &str, mode: GenerationMode) -> Self {
        Self {
            name: name.to_string(),
            family: "remote".to_string(),
            capabilities: vec![mode.as_str().to_string()],
            default_steps: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, family: &str, capabilities: &[&str], default_steps: Option<u32>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                family: family.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                default_steps,
            },
        );
    };

    insert(
        DEFAULT_MODEL,
        "stable-diffusion",
        &["text-to-image", "image-to-image"],
        Some(50),
    );
    insert(
        "sd-v2-1",
        "stable-diffusion",
        &["text-to-image", "image-to-image"],
        Some(50),
    );
    insert("sdxl-base-1.0", "sdxl", &["text-to-image"], Some(40));
    insert("sdxl-refiner-1.0", "sdxl", &["image-to-image"], Some(25));
    insert(
        "dryrun-image-1",
        "dryrun",
        &["text-to-image", "image-to-image"],
        None,
    );

    map
}
