use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::decode::decode_base64;

static RE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:vmess|vless|trojan|ss|socks|socks5|http|https|wireguard|hysteria2|hy2)://[A-Za-z0-9_\-\.:@\?=&%#\+/]+",
    )
    .unwrap()
});

/// 从任意文本里提取代理链接。
///
/// 文本里没有 "://" 时会尝试把整块内容当 base64 订阅解码后重试。
/// 返回值保持出现顺序并已去重。
pub fn extract_links(text: &str) -> Vec<String> {
    let mut text = text.to_string();

    if !text.contains("://") {
        let clean: String = text
            .chars()
            .filter(|c| !matches!(c, '\n' | '\r' | ' ' | '\t'))
            .collect();

        if let Some(decoded) = decode_base64(&clean) {
            if decoded.contains("://") {
                text = decoded;
            }
        }
    }

    let mut links = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for m in RE_LINK.find_iter(line) {
            // 抓取文本里链接后面常粘着标点
            let clean = m.as_str().trim_end_matches(['.', ',', ';', ')', '"']);
            if !clean.is_empty() {
                links.push(clean.to_string());
            }
        }
    }

    dedup_preserving_order(links)
}

fn dedup_preserving_order(input: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    input
        .into_iter()
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn test_extracts_from_mixed_text() {
        let text = "try this vless://uuid@h.example:443?security=tls#x, and\nalso trojan://pw@t.example:443.";
        let links = extract_links(text);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], "vless://uuid@h.example:443?security=tls#x");
        assert_eq!(links[1], "trojan://pw@t.example:443");
    }

    #[test]
    fn test_deduplicates_preserving_order() {
        let text = "trojan://pw@a:443\nvless://u@b:443\ntrojan://pw@a:443";
        let links = extract_links(text);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], "trojan://pw@a:443");
    }

    #[test]
    fn test_base64_subscription_blob() {
        let body = "vless://uuid@h.example:443#a\ntrojan://pw@t.example:443#b";
        let blob = STANDARD.encode(body);
        // 订阅内容常被按行折断
        let wrapped = format!("{}\n{}", &blob[..10], &blob[10..]);
        let links = extract_links(&wrapped);
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn test_plain_garbage_yields_nothing() {
        assert!(extract_links("hello world, nothing here").is_empty());
    }

    #[test]
    fn test_trailing_punctuation_trimmed() {
        let links = extract_links(r#"see trojan://pw@a.example:443;"#);
        assert_eq!(links[0], "trojan://pw@a.example:443");
    }
}
