//! 分类策略：决定一个代理能否进入某个分类、以及进入后按什么分值排位。

mod standard;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;
use crate::model::ProxyRecord;

pub use standard::StandardStrategy;

pub type Params = HashMap<String, serde_json::Value>;

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 纯结构性过滤（协议前缀、入口 ISP 等），不依赖测量结果。
    fn is_candidate(&self, proxy: &ProxyRecord, params: &Params) -> bool;

    /// 桶内排位用的分值。perf_score 是归一化后的吞吐分。
    fn score(&self, perf_score: f64, proxy: &ProxyRecord, params: &Params) -> f64;
}

/// 策略注册表：启动时显式构建并传入引擎，不依赖全局可变状态。
pub struct StrategyRegistry {
    entries: HashMap<&'static str, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// 内置策略齐备的注册表。
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StandardStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.entries.insert(strategy.name(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Strategy>, CoreError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("strategy '{}' not found", name).into())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_has_standard() {
        let registry = StrategyRegistry::builtin();
        assert!(registry.get("standard").is_ok());
        assert!(registry.get("missing").is_err());
    }
}
