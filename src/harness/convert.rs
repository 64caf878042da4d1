use serde_json::{json, Value};

use crate::error::CoreError;
use crate::parser::Profile;

/// Profile 转引擎出站配置。先做结构校验，不合格的直接拒绝，
/// 避免把坏配置塞进整批实例拖垮启动。
pub fn to_outbound(p: &Profile, tag: &str) -> Result<Value, CoreError> {
    validate(p)?;

    let (protocol, settings) = match p.protocol.as_str() {
        "vmess" => ("vmess", vmess_settings(p)),
        "vless" => ("vless", vless_settings(p)),
        "trojan" => ("trojan", trojan_settings(p)),
        "shadowsocks" => ("shadowsocks", shadowsocks_settings(p)),
        "socks" => ("socks", server_settings(p)),
        "http" => ("http", server_settings(p)),
        "wireguard" => ("wireguard", wireguard_settings(p)),
        "hysteria2" => ("hysteria2", hysteria2_settings(p)),
        other => return Err(CoreError::UnsupportedProtocol(other.to_string())),
    };

    let mut outbound = json!({
        "tag": tag,
        "protocol": protocol,
        "settings": settings,
    });

    if let Some(stream) = stream_settings(p) {
        outbound["streamSettings"] = stream;
    }

    Ok(outbound)
}

fn validate(p: &Profile) -> Result<(), CoreError> {
    let fail = |reason: &str| Err(CoreError::invalid_uri(&p.protocol, reason));

    if p.address.trim().is_empty() {
        return fail("empty address");
    }
    if p.port == 0 && p.protocol != "wireguard" {
        return fail("zero port");
    }

    match p.protocol.as_str() {
        "vmess" | "vless" => {
            if p.password.is_empty() {
                return fail("uuid required");
            }
        }
        "trojan" => {
            if p.password.is_empty() {
                return fail("password required");
            }
        }
        "shadowsocks" => {
            if p.password.is_empty() || p.method.is_empty() {
                return fail("method and password required");
            }
        }
        "wireguard" => {
            if p.secret_key.is_empty() || p.public_key.is_empty() {
                return fail("key pair required");
            }
        }
        _ => {}
    }

    if p.security == "reality" && (p.pbk.is_empty() || p.sid.is_empty()) {
        return fail("reality requires pbk and sid");
    }

    Ok(())
}

fn vmess_settings(p: &Profile) -> Value {
    json!({
        "vnext": [{
            "address": p.address,
            "port": p.port,
            "users": [{
                "id": p.password,
                "alterId": 0,
                "security": p.method,
            }],
        }],
    })
}

fn vless_settings(p: &Profile) -> Value {
    json!({
        "vnext": [{
            "address": p.address,
            "port": p.port,
            "users": [{
                "id": p.password,
                "encryption": if p.method.is_empty() { "none" } else { p.method.as_str() },
                "flow": p.flow,
            }],
        }],
    })
}

fn trojan_settings(p: &Profile) -> Value {
    json!({
        "servers": [{
            "address": p.address,
            "port": p.port,
            "password": p.password,
        }],
    })
}

fn shadowsocks_settings(p: &Profile) -> Value {
    json!({
        "servers": [{
            "address": p.address,
            "port": p.port,
            "method": p.method,
            "password": p.password,
        }],
    })
}

/// socks 与 http 出站结构相同：servers 数组加可选 users。
fn server_settings(p: &Profile) -> Value {
    let mut server = json!({
        "address": p.address,
        "port": p.port,
    });
    if !p.username.is_empty() {
        server["users"] = json!([{ "user": p.username, "pass": p.password }]);
    }
    json!({ "servers": [server] })
}

fn wireguard_settings(p: &Profile) -> Value {
    json!({
        "secretKey": p.secret_key,
        "address": [p.local_address],
        "peers": [{
            "publicKey": p.public_key,
            "preSharedKey": p.pre_shared_key,
            "endpoint": format!("{}:{}", p.address, p.port),
        }],
        "reserved": p.reserved,
        "mtu": p.mtu,
    })
}

fn hysteria2_settings(p: &Profile) -> Value {
    json!({
        "address": p.address,
        "port": p.port,
        "auth": p.password,
        "obfs": {
            "type": p.obfs,
            "salamander": { "password": p.obfs_password },
        },
    })
}

fn stream_settings(p: &Profile) -> Option<Value> {
    // WireGuard 不走流式传输层
    if p.protocol == "wireguard" {
        return None;
    }

    let network = p.canonical_network();
    let mut stream = json!({
        "network": network,
        "security": p.security,
    });

    if p.security == "tls" || p.security == "reality" {
        let mut tls = json!({
            "serverName": p.sni,
            "fingerprint": p.fingerprint,
        });
        if !p.alpn.is_empty() {
            tls["alpn"] = json!(p.alpn);
        }
        if p.insecure {
            tls["allowInsecure"] = json!(true);
        }
        stream["tlsSettings"] = tls;

        if p.security == "reality" {
            stream["realitySettings"] = json!({
                "serverName": p.sni,
                "fingerprint": p.fingerprint,
                "publicKey": p.pbk,
                "shortId": p.sid,
                "spiderX": p.spider_x,
            });
        }
    }

    match network.as_str() {
        "ws" => {
            stream["wsSettings"] = json!({
                "path": p.path,
                "headers": { "Host": p.host },
            });
        }
        "grpc" => {
            let mut grpc = json!({ "serviceName": p.service_name });
            if p.mode == "multi" {
                grpc["multiMode"] = json!(true);
            }
            stream["grpcSettings"] = grpc;
        }
        "tcp" => {
            if p.header_type == "http" {
                stream["tcpSettings"] = json!({
                    "header": {
                        "type": "http",
                        "request": {
                            "headers": { "Host": [p.host] },
                            "path": [p.path],
                        },
                    },
                });
            }
        }
        "kcp" => {
            stream["kcpSettings"] = json!({ "seed": p.seed });
        }
        _ => {}
    }

    Some(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_vless_reality_outbound_shape() {
        let p = parse("vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&fp=chrome&sni=a.com&flow=xtls-rprx-vision").unwrap();
        let out = to_outbound(&p, "out_0").unwrap();

        assert_eq!(out["tag"], "out_0");
        assert_eq!(out["protocol"], "vless");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["id"], "uuid");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["flow"], "xtls-rprx-vision");
        assert_eq!(out["streamSettings"]["realitySettings"]["publicKey"], "KEY");
        assert_eq!(out["streamSettings"]["realitySettings"]["shortId"], "SID");
    }

    #[test]
    fn test_reality_without_keys_rejected() {
        let p = parse("vless://uuid@h.example:443?security=reality").unwrap();
        assert!(to_outbound(&p, "out_0").is_err());
    }

    #[test]
    fn test_ws_transport_mapping() {
        let p = parse("trojan://pw@h.example:443?type=ws&path=/ws&host=cdn.example&security=tls&sni=cdn.example").unwrap();
        let out = to_outbound(&p, "out_1").unwrap();

        assert_eq!(out["streamSettings"]["network"], "ws");
        assert_eq!(out["streamSettings"]["wsSettings"]["path"], "/ws");
        assert_eq!(out["streamSettings"]["wsSettings"]["headers"]["Host"], "cdn.example");
    }

    #[test]
    fn test_grpc_multi_mode() {
        let p = parse("vless://uuid@h.example:443?type=grpc&serviceName=svc&mode=multi").unwrap();
        let out = to_outbound(&p, "t").unwrap();
        assert_eq!(out["streamSettings"]["grpcSettings"]["serviceName"], "svc");
        assert_eq!(out["streamSettings"]["grpcSettings"]["multiMode"], true);
    }

    #[test]
    fn test_shadowsocks_requires_method() {
        let mut p = parse("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@1.2.3.4:8388").unwrap();
        assert!(to_outbound(&p, "t").is_ok());
        p.method = String::new();
        assert!(to_outbound(&p, "t").is_err());
    }

    #[test]
    fn test_wireguard_outbound_shape() {
        let p = parse("wireguard://c2VjcmV0@1.2.3.4:51820?publickey=cHVi&address=10.0.0.2/32&mtu=1380&reserved=1,2,3").unwrap();
        let out = to_outbound(&p, "wg").unwrap();
        assert_eq!(out["settings"]["secretKey"], "c2VjcmV0");
        assert_eq!(out["settings"]["peers"][0]["endpoint"], "1.2.3.4:51820");
        assert!(out.get("streamSettings").is_none());
    }

    #[test]
    fn test_hysteria2_obfs_nesting() {
        let p = parse("hysteria2://auth@h.example:8443?obfs-password=pw").unwrap();
        let out = to_outbound(&p, "hy").unwrap();
        assert_eq!(out["settings"]["auth"], "auth");
        assert_eq!(out["settings"]["obfs"]["type"], "salamander");
        assert_eq!(out["settings"]["obfs"]["salamander"]["password"], "pw");
    }
}
