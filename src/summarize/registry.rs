use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::{ChatProvider, SummaryProvider};

/// One configured backend. Position in the provider list is priority:
/// reduction walks them in the order they were configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    /// endpoint root, e.g. `https://api.deepseek.com/v1`
    pub base_url: String,
    pub model: String,
    /// minimum seconds between requests to this backend
    #[serde(default)]
    pub min_interval: f64,
    /// system prompt override
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Turn the configured list into live backends, preserving order.
pub fn build(configs: &[ProviderConfig]) -> Vec<Arc<dyn SummaryProvider>> {
    configs
        .iter()
        .map(|c| Arc::new(ChatProvider::new(c.clone())) as Arc<dyn SummaryProvider>)
        .collect()
}
