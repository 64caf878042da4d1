use tracing::{info, warn};

use crate::config::TesterConfig;
use crate::geoip::GeoIp;
use crate::tester::Tester;

/// 观测环境：本机出口 ISP 与直连基线速度。
///
/// 历史成绩按 ISP 分区，基线用来把测量值归一化成
/// "相对本地线路的倍数"，1.0 即与直连持平。
#[derive(Debug, Clone)]
pub struct Env {
    pub isp: String,
    pub baseline_mbps: f64,
}

impl Env {
    /// 基线探测失败时的兜底，保证流水线还能继续跑。
    pub fn fallback() -> Self {
        Self {
            isp: "unknown".to_string(),
            baseline_mbps: 1.0,
        }
    }
}

/// 直连探测 echo 与测速端点，得到观测环境。
pub async fn detect(cfg: &TesterConfig, geoip: &GeoIp) -> Env {
    info!("🌍 正在探测本机网络环境...");

    let tester = Tester::new(cfg.clone());

    let meta = match tester.analyze_direct(geoip).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!("环境探测失败：{}，回退为 unknown/1.0 Mbps", e);
            return Env::fallback();
        }
    };
    info!("   -> 当前 ISP: {} ({}) [IP: {}]", meta.isp, meta.country, meta.ip);

    let baseline = match tester.speed_check_direct().await {
        Ok((mbps, _bytes)) => mbps,
        Err(e) => {
            warn!("基线测速失败：{}，回退为 1.0 Mbps", e);
            return Env {
                isp: meta.isp,
                baseline_mbps: 1.0,
            };
        }
    };
    info!("   -> 直连基线：{:.2} Mbps", baseline);

    Env {
        isp: meta.isp,
        baseline_mbps: baseline,
    }
}
