use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

use super::decode::{apply_query_params, decode_base64, percent_decode};
use super::profile::Profile;

/// vmess 传统 base64-JSON 形态的字段。端口和 aid 在野外既有数字也有字符串。
#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct VmessJson {
    #[serde(default)]
    pub v: serde_json::Value,
    #[serde(default)]
    pub ps: String,
    #[serde(default)]
    pub add: String,
    #[serde(default)]
    pub port: serde_json::Value,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub aid: serde_json::Value,
    #[serde(default)]
    pub scy: String,
    #[serde(default)]
    pub net: String,
    #[serde(default, rename = "type")]
    pub header_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tls: String,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub alpn: String,
    #[serde(default)]
    pub fp: String,
}

fn parse_url(raw: &str, scheme: &str) -> Result<Url, CoreError> {
    Url::parse(raw).map_err(|e| CoreError::invalid_uri(scheme, e.to_string()))
}

/// IPv6 主机在 URI 里带方括号，统一剥掉。
fn host_of(u: &Url) -> String {
    u.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

fn port_of(u: &Url, scheme: &str) -> Result<u16, CoreError> {
    match u.port() {
        Some(p) if p > 0 => Ok(p),
        _ => Err(CoreError::invalid_uri(scheme, "missing or zero port")),
    }
}

/// userinfo 整体（user 或 user:pass），百分号解码后返回。
fn userinfo_of(u: &Url) -> String {
    let user = percent_decode(u.username());
    match u.password() {
        Some(pass) => format!("{}:{}", user, percent_decode(pass)),
        None => user,
    }
}

pub fn parse_vmess(raw: &str) -> Result<Profile, CoreError> {
    // 标准 URI 形态（带查询参数）复用通用解析
    if raw.contains('?') && raw.contains('&') {
        return parse_generic(raw, "vmess");
    }

    // 传统 base64-JSON 形态
    let b64 = raw.strip_prefix("vmess://").unwrap_or(raw);
    let json_str = decode_base64(b64)
        .ok_or_else(|| CoreError::invalid_uri("vmess", "base64 decode failed"))?;

    let v: VmessJson = serde_json::from_str(&json_str)
        .map_err(|e| CoreError::invalid_uri("vmess", format!("json: {}", e)))?;

    let port = json_number(&v.port)
        .filter(|&p| p > 0 && p <= 65535)
        .ok_or_else(|| CoreError::invalid_uri("vmess", "bad port"))? as u16;

    let mut p = Profile {
        protocol: "vmess".to_string(),
        raw_uri: raw.to_string(),
        remarks: v.ps,
        address: v.add,
        port,
        password: v.id,
        method: v.scy,
        network: v.net,
        host: v.host,
        path: v.path.clone(),
        security: v.tls,
        sni: v.sni,
        fingerprint: v.fp,
        ..Default::default()
    };

    if p.method.is_empty() {
        p.method = "auto".to_string();
    }
    if !v.alpn.is_empty() {
        p.alpn = v.alpn.split(',').map(str::to_string).collect();
    }

    // 传统形态把 gRPC 的 mode 放在 type、serviceName 放在 path；KCP 的 seed 也放在 path
    p.header_type = v.header_type.clone();
    if p.network == "grpc" {
        p.mode = v.header_type;
        p.service_name = v.path;
    } else if p.network == "kcp" {
        p.seed = v.path;
    }

    Ok(p)
}

/// VLESS / Trojan / Hysteria2 / 标准 VMess 共用的通用 URI 形态。
pub fn parse_generic(raw: &str, scheme: &str) -> Result<Profile, CoreError> {
    let u = parse_url(raw, scheme)?;

    let mut p = Profile {
        protocol: u.scheme().to_lowercase(),
        raw_uri: raw.to_string(),
        address: host_of(&u),
        remarks: percent_decode(u.fragment().unwrap_or_default()),
        password: userinfo_of(&u),
        port: port_of(&u, scheme)?,
        ..Default::default()
    };

    apply_query_params(&mut p, &u);

    if p.protocol == "vless" {
        p.method = query_value(&u, "encryption").unwrap_or_default();
        if p.method.is_empty() {
            p.method = "none".to_string();
        }
    } else if p.protocol == "vmess" {
        p.method = "auto".to_string();
    }

    Ok(p)
}

pub fn parse_trojan(raw: &str) -> Result<Profile, CoreError> {
    let mut p = parse_generic(raw, "trojan")?;
    p.protocol = "trojan".to_string();
    if p.network.is_empty() {
        p.network = "tcp".to_string();
    }
    Ok(p)
}

pub fn parse_hysteria2(raw: &str) -> Result<Profile, CoreError> {
    let mut p = parse_generic(raw, "hysteria2")?;
    p.protocol = "hysteria2".to_string();

    let u = parse_url(raw, "hysteria2")?;
    p.obfs_password = query_value(&u, "obfs-password").unwrap_or_default();
    p.port_hopping = query_value(&u, "mport").unwrap_or_default();
    if !p.obfs_password.is_empty() {
        p.obfs = "salamander".to_string();
    }
    Ok(p)
}

static RE_OBFS_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"obfs-host=([^;]+)").unwrap());
static RE_OBFS_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"path=([^;]+)").unwrap());

pub fn parse_shadowsocks(raw: &str) -> Result<Profile, CoreError> {
    let u = parse_url(raw, "shadowsocks")?;

    let mut p = Profile {
        protocol: "shadowsocks".to_string(),
        raw_uri: raw.to_string(),
        address: host_of(&u),
        remarks: percent_decode(u.fragment().unwrap_or_default()),
        port: port_of(&u, "shadowsocks")?,
        ..Default::default()
    };

    // SIP002：userinfo 无冒号时整块是 base64(method:password)
    let mut userinfo = userinfo_of(&u);
    if !userinfo.contains(':') {
        if let Some(decoded) = decode_base64(&userinfo) {
            userinfo = decoded;
        }
    }

    match userinfo.split_once(':') {
        Some((method, password)) => {
            p.method = method.to_string();
            p.password = password.to_string();
        }
        None => {
            return Err(CoreError::invalid_uri("shadowsocks", "invalid userinfo"));
        }
    }

    // 插件只认 obfs=http，其余变体在这里被丢弃
    if let Some(plugin) = query_value(&u, "plugin") {
        if plugin.contains("obfs=http") {
            p.network = "tcp".to_string();
            p.header_type = "http".to_string();

            if let Some(m) = RE_OBFS_HOST.captures(&plugin) {
                p.host = m[1].to_string();
            }
            if let Some(m) = RE_OBFS_PATH.captures(&plugin) {
                p.path = m[1].to_string();
            }
        }
    }

    Ok(p)
}

pub fn parse_socks(raw: &str, proto: &str) -> Result<Profile, CoreError> {
    let u = parse_url(raw, proto)?;

    let mut p = Profile {
        protocol: proto.to_string(),
        raw_uri: raw.to_string(),
        address: host_of(&u),
        remarks: percent_decode(u.fragment().unwrap_or_default()),
        port: port_of(&u, proto)?,
        ..Default::default()
    };

    if !u.username().is_empty() {
        p.username = percent_decode(u.username());
        p.password = percent_decode(u.password().unwrap_or_default());
    }
    Ok(p)
}

pub fn parse_wireguard(raw: &str) -> Result<Profile, CoreError> {
    let u = parse_url(raw, "wireguard")?;

    let mut p = Profile {
        protocol: "wireguard".to_string(),
        raw_uri: raw.to_string(),
        address: host_of(&u),
        remarks: percent_decode(u.fragment().unwrap_or_default()),
        // 私钥放在 userinfo
        secret_key: userinfo_of(&u),
        // WireGuard 容忍 0 端口
        port: u.port().unwrap_or(0),
        ..Default::default()
    };

    p.public_key = query_value(&u, "publickey").unwrap_or_default();
    p.pre_shared_key = query_value(&u, "presharedkey").unwrap_or_default();
    p.local_address =
        query_value(&u, "address").unwrap_or_else(|| "172.16.0.2/32".to_string());

    if let Some(mtu) = query_value(&u, "mtu") {
        p.mtu = mtu.parse().unwrap_or(0);
    }

    // "1,2,3" -> [1,2,3]
    if let Some(reserved) = query_value(&u, "reserved") {
        p.reserved = reserved
            .split(',')
            .filter_map(|part| part.trim().parse::<u8>().ok())
            .collect();
    }

    Ok(p)
}

fn query_value(u: &Url, key: &str) -> Option<String> {
    u.query_pairs()
        .find(|(k, _)| k.as_ref() == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn json_number(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
