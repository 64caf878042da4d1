use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use percent_encoding::percent_decode_str;
use url::Url;

use super::profile::Profile;

/// 解码标准或 URL-safe base64，自动补齐缺失的 padding。
pub fn decode_base64(s: &str) -> Option<String> {
    if s.is_empty() {
        return Some(String::new());
    }

    let mut padded = s.to_string();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.push_str(&"=".repeat(4 - rem));
    }

    if let Ok(bytes) = STANDARD.decode(&padded) {
        return String::from_utf8(bytes).ok();
    }
    if let Ok(bytes) = URL_SAFE.decode(&padded) {
        return String::from_utf8(bytes).ok();
    }
    None
}

/// 清理抓取链接里的常见杂质（换行、首尾空白）。
pub fn fix_illegal_url(s: &str) -> String {
    s.trim().replace(['\r', '\n'], "")
}

pub fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// 从查询参数提取传输层与安全层字段。
///
/// 与主流客户端的订阅链接字段命名保持一致。
pub fn apply_query_params(p: &mut Profile, url: &Url) {
    for (key, value) in url.query_pairs() {
        if value.is_empty() {
            continue;
        }
        let value = value.into_owned();
        match key.as_ref() {
            "type" => p.network = value,
            "headerType" => p.header_type = value,
            "host" => p.host = value,
            "path" => p.path = value,
            "seed" => p.seed = value,
            "quicSecurity" => p.quic_security = value,
            "key" => p.quic_key = value,
            "mode" => p.mode = value,
            "serviceName" => p.service_name = value,
            "authority" => p.authority = value,
            "security" => p.security = value,
            "sni" => p.sni = value,
            "fp" => p.fingerprint = value,
            "alpn" => p.alpn = value.split(',').map(str::to_string).collect(),
            "pbk" => p.pbk = value,
            "sid" => p.sid = value,
            "spx" => p.spider_x = value,
            "flow" => p.flow = value,
            // 1/0/true/false 的几种写法都有人用
            "allowInsecure" | "insecure" | "allow_insecure" => {
                if !p.insecure {
                    p.insecure = value == "1" || value == "true";
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_standard() {
        assert_eq!(decode_base64("aGVsbG8=").as_deref(), Some("hello"));
    }

    #[test]
    fn test_decode_base64_missing_padding() {
        assert_eq!(decode_base64("aGVsbG8").as_deref(), Some("hello"));
    }

    #[test]
    fn test_decode_base64_url_safe() {
        // '-' 与 '_' 只在 URL-safe 字母表里合法
        assert_eq!(decode_base64("Pz8_Pw").as_deref(), Some("????"));
    }

    #[test]
    fn test_decode_base64_garbage() {
        assert!(decode_base64("!!!!").is_none());
    }

    #[test]
    fn test_fix_illegal_url() {
        assert_eq!(fix_illegal_url("  vless://a\r\n"), "vless://a");
    }

    #[test]
    fn test_insecure_aliases() {
        let mut p = Profile::default();
        let u = Url::parse("trojan://pw@h:443?allowInsecure=1").unwrap();
        apply_query_params(&mut p, &u);
        assert!(p.insecure);

        let mut p = Profile::default();
        let u = Url::parse("trojan://pw@h:443?insecure=true").unwrap();
        apply_query_params(&mut p, &u);
        assert!(p.insecure);

        let mut p = Profile::default();
        let u = Url::parse("trojan://pw@h:443?allow_insecure=0").unwrap();
        apply_query_params(&mut p, &u);
        assert!(!p.insecure);
    }
}
