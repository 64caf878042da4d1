//! 采集器：从外部来源拉取原始代理链接。
//!
//! 约定的注入参数：`_proxy_url` 让采集流量走现成的代理，
//! `_timeout` / `_retries` 控制单请求行为；其余参数各采集器自理。

mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::CoreError;

pub use http::HttpCollector;

pub type Params = HashMap<String, serde_json::Value>;

#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn collect(&self, params: &Params) -> Result<Vec<String>, CoreError>;
}

/// 采集器注册表，启动时显式构建。
pub struct CollectorRegistry {
    entries: HashMap<&'static str, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpCollector));
        registry
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.entries.insert(collector.name(), collector);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Collector>, CoreError> {
        self.entries
            .get(kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("collector plugin '{}' not found", kind).into())
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// 注入参数的便捷读取。
pub(crate) fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

pub(crate) fn param_u64(params: &Params, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = CollectorRegistry::builtin();
        assert!(registry.get("http").is_ok());
        assert!(registry.get("telegram").is_err());
    }

    #[test]
    fn test_param_helpers() {
        let mut params = Params::new();
        params.insert("url".into(), serde_json::json!("https://x.example/sub"));
        params.insert("_timeout".into(), serde_json::json!(30));
        params.insert("empty".into(), serde_json::json!(""));

        assert_eq!(param_str(&params, "url"), Some("https://x.example/sub"));
        assert_eq!(param_str(&params, "empty"), None);
        assert_eq!(param_u64(&params, "_timeout"), Some(30));
        assert_eq!(param_u64(&params, "missing"), None);
    }
}
