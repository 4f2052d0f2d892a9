use indexmap::IndexMap;
use serde::Serialize;

use crate::generation::{Modality, Provider};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub endpoint_id: String,
    pub provider: Provider,
    pub modality: Modality,
    pub description: String,
    pub default_params: IndexMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new(tools: Option<IndexMap<String, ToolSpec>>) -> Self {
        Self {
            tools: tools.unwrap_or_else(default_tools),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn by_modality(&self, modality: Modality) -> Vec<ToolSpec> {
        self.tools
            .values()
            .filter(|tool| tool.modality == modality)
            .cloned()
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_tools() -> IndexMap<String, ToolSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      endpoint_id: &str,
                      provider: Provider,
                      modality: Modality,
                      description: &str,
                      default_params: &[(&str, f64)]| {
        map.insert(
            name.to_string(),
            ToolSpec {
                name: name.to_string(),
                endpoint_id: endpoint_id.to_string(),
                provider,
                modality,
                description: description.to_string(),
                default_params: default_params
                    .iter()
                    .map(|(key, value)| ((*key).to_string(), *value))
                    .collect(),
            },
        );
    };

    insert(
        "EPK Generator",
        "anthropic.claude-3-sonnet-20240229-v1:0",
        Provider::Anthropic,
        Modality::Text,
        "Generate professional Electronic Press Kits for artists",
        &[("temperature", 0.7), ("top_p", 0.99)],
    );
    insert(
        "Album Art Creator",
        "stability.stable-diffusion-xl-v1",
        Provider::Stability,
        Modality::Image,
        "Create album artwork from a written brief",
        &[("cfg_scale", 10.0), ("steps", 50.0), ("seed", 42.0)],
    );
    insert(
        "Marketing Copy Generator",
        "anthropic.claude-3-sonnet-20240229-v1:0",
        Provider::Anthropic,
        Modality::Text,
        "Generate engaging marketing copy for music releases",
        &[("temperature", 0.8), ("top_p", 0.99)],
    );
    insert(
        "Marketing Advisor",
        "anthropic.claude-3-sonnet-20240229-v1:0",
        Provider::Anthropic,
        Modality::Text,
        "Get strategic marketing advice for your music",
        &[("temperature", 0.7), ("top_p", 0.99)],
    );
    insert(
        "Lyric Draft Assistant",
        "meta.llama3-70b-instruct-v1:0",
        Provider::Meta,
        Modality::Text,
        "Draft and rework song lyrics",
        &[("temperature", 0.5), ("top_p", 0.9), ("max_gen_len", 512.0)],
    );
    insert(
        "Artwork Reviewer",
        "meta.llama3-2-90b-instruct-v1:0",
        Provider::Meta,
        Modality::TextAndVision,
        "Critique uploaded cover art against the release brief",
        &[("temperature", 0.5), ("top_p", 0.9), ("max_gen_len", 512.0)],
    );

    map
}

#[cfg(test)]
mod tests {
    use crate::generation::{Modality, Provider};

    use super::ToolRegistry;

    #[test]
    fn default_registry_keeps_insertion_order() {
        let registry = ToolRegistry::new(None);
        let names: Vec<&str> = registry.list().map(|tool| tool.name.as_str()).collect();
        assert_eq!(names[0], "EPK Generator");
        assert_eq!(names[1], "Album Art Creator");
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn album_art_tool_carries_diffusion_defaults() {
        let registry = ToolRegistry::new(None);
        let tool = registry.get("Album Art Creator").unwrap();
        assert_eq!(tool.provider, Provider::Stability);
        assert_eq!(tool.modality, Modality::Image);
        assert_eq!(tool.default_params.get("cfg_scale"), Some(&10.0));
        assert_eq!(tool.default_params.get("steps"), Some(&50.0));
        assert_eq!(tool.default_params.get("seed"), Some(&42.0));
    }

    #[test]
    fn by_modality_filters_tools() {
        let registry = ToolRegistry::new(None);
        let image_tools = registry.by_modality(Modality::Image);
        assert_eq!(image_tools.len(), 1);
        assert_eq!(image_tools[0].name, "Album Art Creator");

        let vision_tools = registry.by_modality(Modality::TextAndVision);
        assert_eq!(vision_tools.len(), 1);
        assert_eq!(vision_tools[0].provider, Provider::Meta);
    }

    #[test]
    fn unknown_tool_is_absent() {
        let registry = ToolRegistry::new(None);
        assert!(registry.get("Podcast Producer").is_none());
    }
}
