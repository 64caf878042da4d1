use serde::{Deserialize, Serialize};

/// 任意协议链接解析后的统一配置形态。
///
/// 字段采用零值语义：空字符串表示"未设置"，与指纹归一化规则配合使用。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// vmess, vless, trojan, shadowsocks, socks, http, wireguard, hysteria2
    pub protocol: String,
    pub raw_uri: String,
    pub remarks: String,

    // 连接目标
    pub address: String,
    pub port: u16,

    // 认证
    pub username: String,
    /// UUID / Key / Password
    pub password: String,
    /// 加密方式（SS/VMess）
    pub method: String,

    // WireGuard
    pub secret_key: String,
    pub local_address: String,
    pub public_key: String,
    pub pre_shared_key: String,
    pub mtu: u32,
    /// "0,0,0" 解析出的三个字节
    pub reserved: Vec<u8>,

    // Hysteria2
    pub obfs: String,
    pub obfs_password: String,
    /// mport
    pub port_hopping: String,

    // 传输层
    /// tcp, kcp, ws, http, grpc, quic
    pub network: String,
    pub header_type: String,
    pub host: String,
    pub path: String,
    /// KCP seed
    pub seed: String,
    pub quic_security: String,
    pub quic_key: String,
    /// gRPC gun/multi
    pub mode: String,
    pub service_name: String,
    pub authority: String,

    // TLS / REALITY
    /// tls, reality, none
    pub security: String,
    pub insecure: bool,
    pub sni: String,
    /// fp
    pub fingerprint: String,
    pub alpn: Vec<String>,

    pub pbk: String,
    pub sid: String,
    /// spx
    pub spider_x: String,
    /// xtls-rprx-vision
    pub flow: String,
}

impl Profile {
    /// 空网络归一化为 tcp。
    pub fn canonical_network(&self) -> String {
        let net = self.network.to_lowercase();
        if net.is_empty() {
            "tcp".to_string()
        } else {
            net
        }
    }

    /// "none" 伪装头归一化为空。
    pub fn canonical_header_type(&self) -> String {
        let header = self.header_type.to_lowercase();
        if header == "none" {
            String::new()
        } else {
            header
        }
    }

    /// VLESS 的显式 "none" 加密与缺省等价。
    pub fn canonical_method(&self) -> String {
        let method = self.method.to_lowercase();
        if self.protocol == "vless" && method == "none" {
            String::new()
        } else {
            method
        }
    }
}
