//! Search configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Highest edit distance the Levenshtein automata support
pub const MAX_FUZZY_EDITS: u8 = 2;

/// How the multi-field parser combines clauses for separate query words
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MultiFieldMode {
    /// Every word must match in at least one field
    And,
    /// Any word matching in any field is enough
    #[default]
    Or,
}

/// Highlight fragment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightConfig {
    /// Tag inserted before a highlighted token
    #[serde(default = "default_pre_tag")]
    pub pre_tag: String,

    /// Tag inserted after a highlighted token
    #[serde(default = "default_post_tag")]
    pub post_tag: String,

    /// Maximum fragment length in characters
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            pre_tag: default_pre_tag(),
            post_tag: default_post_tag(),
            fragment_size: default_fragment_size(),
        }
    }
}

/// Search service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Root directory under which every index gets its own folder
    #[serde(default = "default_index_root")]
    pub index_root: PathBuf,

    /// Place indexes under `<root>/<tenant>/<index>` when a tenant is current
    #[serde(default)]
    pub per_tenant_index: bool,

    /// Index writer heap size in bytes (default: 50MB)
    #[serde(default = "default_writer_heap_size")]
    pub writer_heap_size: usize,

    /// React to entity change notifications
    #[serde(default = "default_true")]
    pub auto_indexing_enabled: bool,

    /// Default combinator of the multi-field query parser
    #[serde(default)]
    pub multi_field_mode: MultiFieldMode,

    /// Edit distance of the fuzzy query variant
    #[serde(default = "default_fuzzy_max_edits")]
    pub fuzzy_max_edits: u8,

    /// Highlighting options
    #[serde(default)]
    pub highlight: HighlightConfig,

    /// Page size used when a request leaves `take` unset
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Batch size for full resynchronization
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,
}

impl SearchConfig {
    /// Fuzzy distance clamped to what the engine supports
    pub fn effective_fuzzy_edits(&self) -> u8 {
        self.fuzzy_max_edits.min(MAX_FUZZY_EDITS)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_root: default_index_root(),
            per_tenant_index: false,
            writer_heap_size: default_writer_heap_size(),
            auto_indexing_enabled: true,
            multi_field_mode: MultiFieldMode::default(),
            fuzzy_max_edits: default_fuzzy_max_edits(),
            highlight: HighlightConfig::default(),
            default_page_size: default_page_size(),
            sync_batch_size: default_sync_batch_size(),
        }
    }
}

fn default_index_root() -> PathBuf {
    PathBuf::from("./data/search_index")
}

fn default_writer_heap_size() -> usize {
    50_000_000
}

fn default_true() -> bool {
    true
}

fn default_fuzzy_max_edits() -> u8 {
    1
}

fn default_pre_tag() -> String {
    "<em>".to_string()
}

fn default_post_tag() -> String {
    "</em>".to_string()
}

fn default_fragment_size() -> usize {
    100
}

fn default_page_size() -> usize {
    10
}

fn default_sync_batch_size() -> usize {
    1000
}

/// Builder for SearchConfig
pub struct SearchConfigBuilder {
    config: SearchConfig,
}

impl SearchConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SearchConfig::default(),
        }
    }

    pub fn index_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.index_root = path.into();
        self
    }

    pub fn per_tenant_index(mut self, enabled: bool) -> Self {
        self.config.per_tenant_index = enabled;
        self
    }

    pub fn writer_heap_size(mut self, size: usize) -> Self {
        self.config.writer_heap_size = size;
        self
    }

    pub fn auto_indexing_enabled(mut self, enabled: bool) -> Self {
        self.config.auto_indexing_enabled = enabled;
        self
    }

    pub fn multi_field_mode(mut self, mode: MultiFieldMode) -> Self {
        self.config.multi_field_mode = mode;
        self
    }

    pub fn fuzzy_max_edits(mut self, edits: u8) -> Self {
        self.config.fuzzy_max_edits = edits;
        self
    }

    pub fn highlight_tags(mut self, pre: impl Into<String>, post: impl Into<String>) -> Self {
        self.config.highlight.pre_tag = pre.into();
        self.config.highlight.post_tag = post.into();
        self
    }

    pub fn fragment_size(mut self, size: usize) -> Self {
        self.config.highlight.fragment_size = size;
        self
    }

    pub fn default_page_size(mut self, size: usize) -> Self {
        self.config.default_page_size = size;
        self
    }

    pub fn sync_batch_size(mut self, size: usize) -> Self {
        self.config.sync_batch_size = size;
        self
    }

    pub fn build(self) -> SearchConfig {
        self.config
    }
}

impl Default for SearchConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = SearchConfigBuilder::new()
            .index_root("/tmp/idx")
            .multi_field_mode(MultiFieldMode::And)
            .fuzzy_max_edits(5)
            .build();

        assert_eq!(config.index_root, PathBuf::from("/tmp/idx"));
        assert_eq!(config.multi_field_mode, MultiFieldMode::And);
        assert_eq!(config.effective_fuzzy_edits(), MAX_FUZZY_EDITS);
        assert!(config.auto_indexing_enabled);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SearchConfig =
            serde_json::from_str(r#"{"multi_field_mode":"and","per_tenant_index":true}"#).unwrap();
        assert_eq!(config.multi_field_mode, MultiFieldMode::And);
        assert!(config.per_tenant_index);
        assert_eq!(config.highlight.pre_tag, "<em>");
        assert_eq!(config.sync_batch_size, 1000);
    }
}
