use std::net::IpAddr;

use maxminddb::{geoip2, Reader};
use tracing::warn;

use crate::error::CoreError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoResult {
    pub isp: String,
    pub country: String,
}

/// 本地 MaxMind 数据库句柄。进程启动时打开一次，全程只读共享。
pub struct GeoIp {
    asn: Reader<Vec<u8>>,
    country: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// ASN 库是必需的；Country 库缺失时降级运行，国家码回落为 "XX"。
    pub fn open(asn_path: &str, country_path: &str) -> Result<Self, CoreError> {
        let asn = Reader::open_readfile(asn_path)
            .map_err(|e| CoreError::Geo(format!("open asn db {}: {}", asn_path, e)))?;

        let country = if country_path.is_empty() {
            None
        } else {
            match Reader::open_readfile(country_path) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("Country 库打开失败 {}: {}，国家信息将缺失", country_path, e);
                    None
                }
            }
        };

        Ok(Self { asn, country })
    }

    pub fn lookup(&self, ip_str: &str) -> Result<GeoResult, CoreError> {
        let ip: IpAddr = ip_str
            .trim()
            .parse()
            .map_err(|_| CoreError::Geo(format!("invalid ip: {}", ip_str)))?;

        let mut res = GeoResult {
            isp: "Unknown".to_string(),
            country: "XX".to_string(),
        };

        if let Ok(asn) = self.asn.lookup::<geoip2::Asn>(ip) {
            if let Some(org) = asn.autonomous_system_organization {
                res.isp = org.to_string();
            }
        }

        if let Some(reader) = &self.country {
            if let Ok(country) = reader.lookup::<geoip2::Country>(ip) {
                if let Some(code) = country.country.and_then(|c| c.iso_code) {
                    res.country = code.to_string();
                }
            }
        }

        Ok(res)
    }
}
