use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::error;

use crate::model::PerformanceRecord;
use crate::store::ProxyStore;

/// 最近一次测试在移动平均里的权重。
pub const HISTORY_ALPHA: f64 = 0.2;

/// 完全失败时的乘性衰减系数。连续三次失败后分数只剩 ~0.22。
pub const FAILURE_PENALTY: f64 = 0.6;

/// 跨观测网络外推时的保守折扣。
pub const CROSS_ISP_DISCOUNT: f64 = 0.8;

/// 无任何历史时的冷启动分。
pub const COLD_START_SCORE: f64 = 0.2;

pub struct HistoryEngine {
    store: ProxyStore,
    // 历史更新是读-改-写，单写者通道保证同键串行
    update_lock: Arc<Mutex<()>>,
}

impl HistoryEngine {
    pub fn new(store: ProxyStore) -> Self {
        Self {
            store,
            update_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 调度前的预测分：
    /// 本网络有记录用记录；否则用其他网络均分打八折；再不然给冷启动分。
    pub async fn predictive_score(&self, fingerprint: &str, observer_isp: &str) -> f64 {
        match self.store.find_performance(fingerprint, observer_isp).await {
            Ok(Some(perf)) => return perf.score,
            Ok(None) => {}
            Err(e) => {
                error!("读取历史失败 {}: {}", fingerprint, e);
                return COLD_START_SCORE;
            }
        }

        match self.store.avg_score_other_isps(fingerprint, observer_isp).await {
            Ok(Some(avg)) if avg > 0.0 => avg * CROSS_ISP_DISCOUNT,
            _ => COLD_START_SCORE,
        }
    }

    /// 用指数移动平均记录一次测量结果，返回更新后的分数。
    ///
    /// 成功按 EMA 吸收，失败按乘性衰减：失败的代理不管曾经多快，
    /// 现在都不可用，但一次成功又能较快拉回。
    pub async fn update_history(
        &self,
        fingerprint: &str,
        observer_isp: &str,
        raw_mbps: f64,
        baseline_mbps: f64,
    ) -> f64 {
        let normalized = if baseline_mbps > 0.0 && raw_mbps > 0.0 {
            raw_mbps / baseline_mbps
        } else {
            0.0
        };

        let _guard = self.update_lock.lock().await;

        let existing = match self.store.find_performance(fingerprint, observer_isp).await {
            Ok(existing) => existing,
            Err(e) => {
                error!("读取历史失败 {}: {}", fingerprint, e);
                None
            }
        };

        let perf = match existing {
            None => PerformanceRecord {
                fingerprint: fingerprint.to_string(),
                observer_isp: observer_isp.to_string(),
                // 首个样本直接当作当前分
                score: normalized,
                sample_count: 1,
                last_tested_at: Utc::now(),
            },
            Some(mut perf) => {
                perf.score = next_score(perf.score, normalized);
                perf.sample_count += 1;
                perf.last_tested_at = Utc::now();
                perf
            }
        };

        if let Err(e) = self.store.upsert_performance(&perf).await {
            error!("写入历史失败 {}: {}", fingerprint, e);
        }
        perf.score
    }
}

/// 单步更新：成功走 EMA，失败走衰减。
pub fn next_score(prev: f64, normalized: f64) -> f64 {
    if normalized > 0.0 {
        prev * (1.0 - HISTORY_ALPHA) + normalized * HISTORY_ALPHA
    } else {
        prev * FAILURE_PENALTY
    }
}
