use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub system_proxy: SystemProxyConfig,
    #[serde(default)]
    pub tester: TesterConfig,
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
    #[serde(default)]
    pub publishers: Vec<PublisherConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_proxies")]
    pub max_proxies: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SystemProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub fallback: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TesterConfig {
    /// 健康检查超时（秒）
    #[serde(default = "default_health_timeout")]
    pub health_timeout: u64,
    /// 测速超时（秒）
    #[serde(default = "default_speed_timeout")]
    pub speed_timeout: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_echo_url")]
    pub echo_url: String,
    #[serde(default = "default_dirty_check_url")]
    pub dirty_check_url: String,
    #[serde(default = "default_speed_test_url")]
    pub speed_test_url: String,

    #[serde(default = "default_geoip_asn_path")]
    pub geoip_asn_path: String,
    #[serde(default = "default_geoip_country_path")]
    pub geoip_country_path: String,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_anneal_budget_mb")]
    pub anneal_budget_mb: u32,

    /// 外部传输引擎可执行文件路径
    #[serde(default = "default_engine_bin")]
    pub engine_bin: String,
}

impl TesterConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout)
    }

    pub fn speed_timeout(&self) -> Duration {
        Duration::from_secs(self.speed_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_proxies: default_max_proxies(),
        }
    }
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            health_timeout: default_health_timeout(),
            speed_timeout: default_speed_timeout(),
            retries: default_retries(),
            echo_url: default_echo_url(),
            dirty_check_url: default_dirty_check_url(),
            speed_test_url: default_speed_test_url(),
            geoip_asn_path: default_geoip_asn_path(),
            geoip_country_path: default_geoip_country_path(),
            worker_count: default_worker_count(),
            anneal_budget_mb: default_anneal_budget_mb(),
            engine_bin: default_engine_bin(),
        }
    }
}

fn default_db_path() -> String {
    "proxyforge.db".into()
}
fn default_max_proxies() -> u32 {
    10_000
}
fn default_health_timeout() -> u64 {
    8
}
fn default_speed_timeout() -> u64 {
    45
}
fn default_retries() -> u32 {
    2
}
fn default_echo_url() -> String {
    "http://api.ipify.org".into()
}
fn default_dirty_check_url() -> String {
    "https://developers.google.com".into()
}
fn default_speed_test_url() -> String {
    "https://speed.cloudflare.com/__down?bytes=5000000".into()
}
fn default_geoip_asn_path() -> String {
    "GeoLite2-ASN.mmdb".into()
}
fn default_geoip_country_path() -> String {
    "GeoLite2-Country.mmdb".into()
}
fn default_worker_count() -> usize {
    50
}
fn default_anneal_budget_mb() -> u32 {
    500
}
fn default_engine_bin() -> String {
    "xray".into()
}
fn default_strategy() -> String {
    "standard".into()
}
fn default_weight() -> u32 {
    1
}
fn default_bucket_size() -> usize {
    20
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> Result<Self, CoreError> {
        let name = path.unwrap_or("config.yaml");
        let config = config::Config::builder()
            .add_source(config::File::with_name(name))
            .build()?;
        let mut cfg: AppConfig = config.try_deserialize()?;
        cfg.validate();
        Ok(cfg)
    }

    fn validate(&mut self) {
        for cat in &mut self.categories {
            if cat.bucket_size == 0 {
                cat.bucket_size = default_bucket_size();
            }
            if cat.weight == 0 {
                cat.weight = default_weight();
            }
        }
    }

    pub fn filter_collectors(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.collectors.retain(|c| names.contains(&c.name));
    }

    pub fn filter_publishers(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.publishers.retain(|p| names.contains(&p.name));
    }

    pub fn filter_categories(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.categories.retain(|c| names.contains(&c.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TesterConfig::default();
        assert_eq!(cfg.worker_count, 50);
        assert_eq!(cfg.health_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn test_category_filter() {
        let mut cfg = AppConfig {
            database: Default::default(),
            system_proxy: Default::default(),
            tester: Default::default(),
            collectors: vec![],
            categories: vec![
                CategoryConfig {
                    name: "speed".into(),
                    strategy: "standard".into(),
                    weight: 1,
                    bucket_size: 20,
                    params: Default::default(),
                },
                CategoryConfig {
                    name: "clean".into(),
                    strategy: "standard".into(),
                    weight: 1,
                    bucket_size: 20,
                    params: Default::default(),
                },
            ],
            publishers: vec![],
        };
        cfg.filter_categories(&["clean".to_string()]);
        assert_eq!(cfg.categories.len(), 1);
        assert_eq!(cfg.categories[0].name, "clean");
    }
}
