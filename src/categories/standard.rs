use crate::model::ProxyRecord;

use super::{Params, Strategy};

/// 内置策略：协议前缀、出口干净度和入口 ISP 三个可选过滤条件，
/// 排位分值直接用归一化吞吐。
pub struct StandardStrategy;

impl Strategy for StandardStrategy {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn is_candidate(&self, proxy: &ProxyRecord, params: &Params) -> bool {
        if let Some(proto) = params.get("protocol").and_then(|v| v.as_str()) {
            if !proto.is_empty() && !proxy.raw.starts_with(&format!("{}://", proto)) {
                return false;
            }
        }

        if let Some(true) = params.get("require_clean").and_then(|v| v.as_bool()) {
            if proxy.is_dirty {
                return false;
            }
        }

        // 入口 ISP 大小写无关的子串匹配（例如 "hetzner"）
        if let Some(target) = params.get("entry_isp").and_then(|v| v.as_str()) {
            if !target.is_empty() {
                if proxy.entry_isp.is_empty() {
                    return false;
                }
                if !proxy
                    .entry_isp
                    .to_lowercase()
                    .contains(&target.to_lowercase())
                {
                    return false;
                }
            }
        }

        true
    }

    fn score(&self, perf_score: f64, _proxy: &ProxyRecord, _params: &Params) -> f64 {
        perf_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(raw: &str) -> ProxyRecord {
        ProxyRecord::new("fp".into(), raw.into(), "test".into(), "h".into(), 443)
    }

    fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_protocol_filter() {
        let s = StandardStrategy;
        let p = proxy("vless://uuid@h:443");
        assert!(s.is_candidate(&p, &params(&[("protocol", "vless".into())])));
        assert!(!s.is_candidate(&p, &params(&[("protocol", "trojan".into())])));
        // 空协议条件等于不过滤
        assert!(s.is_candidate(&p, &params(&[("protocol", "".into())])));
    }

    #[test]
    fn test_require_clean() {
        let s = StandardStrategy;
        let mut p = proxy("vless://uuid@h:443");
        p.is_dirty = true;
        assert!(!s.is_candidate(&p, &params(&[("require_clean", true.into())])));
        assert!(s.is_candidate(&p, &params(&[("require_clean", false.into())])));
    }

    #[test]
    fn test_entry_isp_substring_case_insensitive() {
        let s = StandardStrategy;
        let mut p = proxy("vless://uuid@h:443");
        p.entry_isp = "Hetzner Online GmbH".into();
        assert!(s.is_candidate(&p, &params(&[("entry_isp", "hetzner".into())])));
        assert!(!s.is_candidate(&p, &params(&[("entry_isp", "ovh".into())])));

        // 入口 ISP 未知时不能通过 ISP 过滤
        p.entry_isp = String::new();
        assert!(!s.is_candidate(&p, &params(&[("entry_isp", "hetzner".into())])));
    }

    #[test]
    fn test_score_is_identity() {
        let s = StandardStrategy;
        let p = proxy("vless://uuid@h:443");
        assert_eq!(s.score(0.42, &p, &Params::new()), 0.42);
    }
}
