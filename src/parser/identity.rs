use sha2::{Digest, Sha256};

use super::profile::Profile;

impl Profile {
    /// 计算内容指纹：只覆盖决定实际连接目标的字段。
    ///
    /// sni / fp / alpn / remarks 等客户端提示字段被刻意排除，
    /// 同一端点的不同订阅抄写会得到相同指纹。
    pub fn fingerprint_hash(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(20);

        // 协议与端点
        parts.push(self.protocol.to_lowercase());
        parts.push(self.address.to_lowercase());
        parts.push(self.port.to_string());

        // 认证
        parts.push(self.username.clone());
        parts.push(self.password.clone());
        parts.push(self.secret_key.clone());
        parts.push(self.canonical_method());

        // 传输层（归一化之后才比较）
        parts.push(self.canonical_network());
        parts.push(self.canonical_header_type());
        parts.push(self.path.clone());
        parts.push(self.mode.clone());
        parts.push(self.service_name.clone());
        parts.push(self.seed.clone());

        // 协议特有
        parts.push(self.flow.clone());
        parts.push(self.obfs.clone());
        parts.push(self.obfs_password.clone());

        // REALITY 密钥区分大小写，保持原样
        parts.push(self.pbk.clone());
        parts.push(self.sid.clone());

        // WireGuard
        parts.push(self.local_address.clone());
        parts.push(self.public_key.clone());

        let signature = parts.join("|");
        hex::encode(Sha256::digest(signature.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse;

    #[test]
    fn test_cosmetic_fields_do_not_change_fingerprint() {
        let a = parse("vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&fp=chrome&sni=a.com#Label1").unwrap();
        let b = parse("vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&fp=firefox&sni=b.com#Label2").unwrap();
        assert_eq!(a.fingerprint_hash(), b.fingerprint_hash());
    }

    #[test]
    fn test_alpn_order_does_not_change_fingerprint() {
        let a = parse("trojan://pw@h.example:443?alpn=h2,http/1.1").unwrap();
        let b = parse("trojan://pw@h.example:443?alpn=http/1.1,h2").unwrap();
        assert_eq!(a.fingerprint_hash(), b.fingerprint_hash());
    }

    #[test]
    fn test_identity_fields_change_fingerprint() {
        let base = parse("vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID").unwrap();
        let variants = [
            "vless://uuid@h.example:444?security=reality&pbk=KEY&sid=SID",
            "vless://uuid@other.example:443?security=reality&pbk=KEY&sid=SID",
            "vless://other@h.example:443?security=reality&pbk=KEY&sid=SID",
            "vless://uuid@h.example:443?security=reality&pbk=OTHER&sid=SID",
            "vless://uuid@h.example:443?security=reality&pbk=KEY&sid=OTHER",
            "vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&flow=xtls-rprx-vision",
            "vless://uuid@h.example:443?security=reality&pbk=KEY&sid=SID&type=ws&path=/ws",
        ];
        for v in variants {
            let other = parse(v).unwrap();
            assert_ne!(
                base.fingerprint_hash(),
                other.fingerprint_hash(),
                "expected distinct fingerprint for {}",
                v
            );
        }
    }

    #[test]
    fn test_case_of_address_is_normalized() {
        let a = parse("trojan://pw@Host.Example:443").unwrap();
        let b = parse("trojan://pw@host.example:443").unwrap();
        assert_eq!(a.fingerprint_hash(), b.fingerprint_hash());
    }

    #[test]
    fn test_vless_none_encryption_equals_default() {
        let a = parse("vless://uuid@h.example:443?encryption=none").unwrap();
        let b = parse("vless://uuid@h.example:443").unwrap();
        assert_eq!(a.fingerprint_hash(), b.fingerprint_hash());
    }

    #[test]
    fn test_empty_network_equals_tcp() {
        let a = parse("vless://uuid@h.example:443?type=tcp").unwrap();
        let b = parse("vless://uuid@h.example:443").unwrap();
        assert_eq!(a.fingerprint_hash(), b.fingerprint_hash());
    }
}
