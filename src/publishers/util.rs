use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{Category, ProxyRecord};
use crate::parser;

use super::Params;

/// 把若干分类拼成一份订阅文本。
///
/// 同一代理可能出现在多个分类里，按指纹合并成一行，
/// 备注重写为 国旗 + 状态标记 + 国家码 + 分类名列表。
pub fn generate_subscription_payload(
    categories: &[Category],
    params: &Params,
) -> Result<String, CoreError> {
    // 保持首次出现的顺序，发布产物可复现
    let mut order: Vec<String> = Vec::new();
    let mut meta: HashMap<String, ProxyRecord> = HashMap::new();
    let mut cats_of: HashMap<String, Vec<String>> = HashMap::new();

    for cat in categories {
        for proxy in &cat.members {
            if !meta.contains_key(&proxy.fingerprint) {
                order.push(proxy.fingerprint.clone());
                meta.insert(proxy.fingerprint.clone(), proxy.clone());
            }
            let names = cats_of.entry(proxy.fingerprint.clone()).or_default();
            if !names.contains(&cat.name) {
                names.push(cat.name.clone());
            }
        }
    }

    let mut lines = Vec::with_capacity(order.len());
    for fingerprint in &order {
        let proxy = &meta[fingerprint];
        let mut profile = match parser::parse(&proxy.raw) {
            Ok(p) => p,
            Err(e) => {
                debug!("发布时丢弃无法解析的链接 {}: {}", fingerprint, e);
                continue;
            }
        };

        let mut names = cats_of.get(fingerprint).cloned().unwrap_or_default();
        names.sort();

        let mut flags = String::new();
        if proxy.is_rotating {
            flags.push_str(" ♻️");
        }
        if proxy.is_dirty {
            flags.push_str(" ⚠️");
        }

        profile.remarks = format!(
            "{}{} {} {}",
            flag_emoji(&proxy.country),
            flags,
            proxy.country,
            names.join("|")
        );
        lines.push(profile.to_uri());
    }

    let text = lines.join("\n");

    let use_base64 = params
        .get("base64")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if use_base64 {
        Ok(STANDARD.encode(text))
    } else {
        Ok(text)
    }
}

/// ISO-3166-α2 国家码转区域指示符国旗；未知归属给地球。
pub fn flag_emoji(country_code: &str) -> String {
    let code = country_code.to_uppercase();
    let bytes = code.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
        return "🌐".to_string();
    }

    bytes
        .iter()
        .filter_map(|&b| char::from_u32(0x1F1E6 + (b - b'A') as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(fp: &str, raw: &str, country: &str) -> ProxyRecord {
        let mut p = ProxyRecord::new(fp.into(), raw.into(), "test".into(), "h".into(), 443);
        p.country = country.into();
        p
    }

    #[test]
    fn test_flag_emoji() {
        assert_eq!(flag_emoji("DE"), "🇩🇪");
        assert_eq!(flag_emoji("us"), "🇺🇸");
        assert_eq!(flag_emoji("XXX"), "🌐");
        assert_eq!(flag_emoji(""), "🌐");
    }

    #[test]
    fn test_payload_merges_categories() {
        let shared = member("fp1", "trojan://pw@h.example:443", "DE");
        let cats = vec![
            Category {
                name: "speed".into(),
                members: vec![shared.clone(), member("fp2", "vless://uuid@v.example:443", "US")],
            },
            Category {
                name: "clean".into(),
                members: vec![shared],
            },
        ];

        let payload = generate_subscription_payload(&cats, &Params::new()).unwrap();
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 2);
        // 同一个代理的两个分类合并在备注里，按名称排序
        assert!(lines[0].contains("clean%7Cspeed") || lines[0].contains("clean|speed"));
    }

    #[test]
    fn test_payload_base64_wrapping() {
        let cats = vec![Category {
            name: "speed".into(),
            members: vec![member("fp1", "trojan://pw@h.example:443", "DE")],
        }];

        let mut params = Params::new();
        params.insert("base64".into(), serde_json::json!(true));
        let payload = generate_subscription_payload(&cats, &params).unwrap();

        let decoded = STANDARD.decode(&payload).unwrap();
        assert!(String::from_utf8(decoded).unwrap().starts_with("trojan://"));
    }

    #[test]
    fn test_status_flags_decorate_remarks() {
        let mut p = member("fp1", "trojan://pw@h.example:443", "DE");
        p.is_rotating = true;
        p.is_dirty = true;
        let cats = vec![Category {
            name: "speed".into(),
            members: vec![p],
        }];

        let payload = generate_subscription_payload(&cats, &Params::new()).unwrap();
        let parsed = parser::parse(payload.lines().next().unwrap()).unwrap();
        assert!(parsed.remarks.contains("♻️"));
        assert!(parsed.remarks.contains("⚠️"));
        assert!(parsed.remarks.contains("🇩🇪"));
        assert!(parsed.remarks.contains("speed"));
    }

    #[test]
    fn test_unparseable_members_are_dropped() {
        let cats = vec![Category {
            name: "speed".into(),
            members: vec![
                member("fp1", "not-a-link", "DE"),
                member("fp2", "trojan://pw@h.example:443", "US"),
            ],
        }];
        let payload = generate_subscription_payload(&cats, &Params::new()).unwrap();
        assert_eq!(payload.lines().count(), 1);
    }
}
