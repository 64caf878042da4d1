use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Deserialize, Serialize)]
pub struct ProxyRecord {
    /// [主键] 指纹（SQLite类型：TEXT NOT NULL）
    /// - SHA-256 内容哈希，跨来源去重的唯一标识
    pub fingerprint: String,

    /// 原始链接（抓取到的完整 URI，原样保存）
    pub raw: String,

    /// 首次发现该代理的来源名称
    pub source: String,

    /// 首次入库时间
    pub created_at: DateTime<Utc>,

    /// 代理服务器地址（域名或 IP，镜像自解析结果，便于查询）
    pub address: String,

    /// 代理服务器端口
    pub port: u16,

    /// 入口元数据：address 解析出的 IP / ISP / 国家
    /// - 首次健康检查时惰性填充
    pub entry_ip: String,
    pub entry_isp: String,
    pub entry_country: String,

    /// 出口元数据：通过代理观测到的 IP / ISP / 国家
    /// - 每次分析都会刷新
    pub ip: String,
    pub isp: String,
    pub country: String,

    /// 出口 IP 被风控站拦截时置位
    pub is_dirty: bool,

    /// 出口 ISP/国家在两次观测间发生变化时置位，置位后不再清除
    pub is_rotating: bool,
}

impl ProxyRecord {
    pub fn new(fingerprint: String, raw: String, source: String, address: String, port: u16) -> Self {
        Self {
            fingerprint,
            raw,
            source,
            created_at: Utc::now(),
            address,
            port,
            entry_ip: String::new(),
            entry_isp: String::new(),
            entry_country: String::new(),
            ip: String::new(),
            isp: String::new(),
            country: String::new(),
            is_dirty: false,
            is_rotating: false,
        }
    }

    /// 协议前缀（"vless://..." -> "vless"），用于统计和策略过滤。
    pub fn scheme(&self) -> &str {
        self.raw.split("://").next().unwrap_or("")
    }
}

/// 复合主键 (fingerprint, observer_isp)：同一代理在不同观测网络下的历史互相独立。
#[derive(Debug, Clone, FromRow, Deserialize, Serialize)]
pub struct PerformanceRecord {
    pub fingerprint: String,
    pub observer_isp: String,

    /// 归一化吞吐的指数移动平均，1.0 ≈ 与直连基线持平
    pub score: f64,

    /// 累计测试次数
    pub sample_count: u32,

    /// 最后一次测试时间
    pub last_tested_at: DateTime<Utc>,
}

/// 优化结果分组，发布器按组输出订阅。
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub members: Vec<ProxyRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_extraction() {
        let p = ProxyRecord::new(
            "abc".into(),
            "vless://uuid@h.example:443".into(),
            "test".into(),
            "h.example".into(),
            443,
        );
        assert_eq!(p.scheme(), "vless");
    }
}
