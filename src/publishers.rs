//! 发布器：把分类好的幸存者输出成订阅。

mod github;
mod stdout;
mod util;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::Category;

pub use github::GithubPublisher;
pub use stdout::StdoutPublisher;
pub use util::{flag_emoji, generate_subscription_payload};

pub type Params = HashMap<String, serde_json::Value>;

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, categories: &[Category], params: &Params) -> Result<(), CoreError>;
}

pub struct PublisherRegistry {
    entries: HashMap<&'static str, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StdoutPublisher));
        registry.register(Arc::new(GithubPublisher));
        registry
    }

    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.entries.insert(publisher.name(), publisher);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Publisher>, CoreError> {
        self.entries
            .get(kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("publisher plugin '{}' not found", kind).into())
    }
}

impl Default for PublisherRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
