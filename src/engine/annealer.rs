use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::categories::{Strategy, StrategyRegistry};
use crate::config::{AppConfig, CategoryConfig};
use crate::environment::Env;
use crate::error::CoreError;
use crate::history::HistoryEngine;
use crate::model::ProxyRecord;
use crate::store::ProxyStore;

use super::bucket::Bucket;
use super::priority::global_priority;

/// 探测出错时计入预算的固定罚金（MiB）。
/// 坏节点往往一个字节都不传，没有罚金循环永远烧不完预算。
const FLAT_FAILURE_PENALTY_MB: f64 = 0.2;

const MIB: f64 = 1024.0 * 1024.0;

/// 单个候选的一轮测量结果。
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    pub mbps: f64,
    pub bytes_downloaded: u64,
    pub failed: bool,
}

/// 测量执行器。真实实现起临时实例走探针，测试里可以直接打桩。
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, proxy: &ProxyRecord) -> ProbeOutcome;
}

pub struct CategoryContext {
    pub config: CategoryConfig,
    pub strategy: Arc<dyn Strategy>,
    pub bucket: Bucket,
}

pub struct Candidate {
    pub proxy: ProxyRecord,
    pub predicted_score: f64,
    pub global_priority: f64,
    /// 命中的分类下标（索引进 categories）
    pub matching_categories: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub data_used_mb: f64,
    pub tested: usize,
    pub survivors: usize,
}

pub struct Annealer {
    store: ProxyStore,
    history: HistoryEngine,
    env: Env,
    categories: Vec<CategoryContext>,
    candidates: Vec<Candidate>,
}

impl Annealer {
    /// 为每个存活代理计算预测分和全局优先级，按优先级降序排好。
    /// 不命中任何分类的代理直接出局。
    pub async fn new(
        store: ProxyStore,
        cfg: &AppConfig,
        env: Env,
        registry: &StrategyRegistry,
        alive: Vec<ProxyRecord>,
    ) -> Result<Self, CoreError> {
        let history = HistoryEngine::new(store.clone());
        let categories = setup_category_contexts(&cfg.categories, registry);

        let mut candidates = Vec::new();
        for proxy in alive {
            let priority =
                global_priority(&proxy, &history, &env.isp, &cfg.categories, registry).await;

            let matching: Vec<usize> = categories
                .iter()
                .enumerate()
                .filter(|(_, ctx)| ctx.strategy.is_candidate(&proxy, &ctx.config.params))
                .map(|(i, _)| i)
                .collect();

            if matching.is_empty() {
                continue;
            }

            let predicted = history.predictive_score(&proxy.fingerprint, &env.isp).await;
            candidates.push(Candidate {
                proxy,
                predicted_score: predicted,
                global_priority: priority,
                matching_categories: matching,
            });
        }

        candidates.sort_by(|a, b| b.global_priority.total_cmp(&a.global_priority));

        Ok(Self {
            store,
            history,
            env,
            categories,
            candidates,
        })
    }

    /// 退火主循环。
    ///
    /// temperature 随预算消耗线性下降，采样窗口随之收缩：
    /// 前期在全量候选里探索，后期只在头部高优先级里收割。
    /// 这是采样温度式退火，没有接受概率那一步。
    pub async fn run(
        &mut self,
        budget_mb: u32,
        prober: &dyn Prober,
        seed: u64,
    ) -> Result<RunReport, CoreError> {
        info!(
            "🔥 开始退火：预算 {} MiB，候选 {} 个",
            budget_mb,
            self.candidates.len()
        );

        let mut rng = StdRng::seed_from_u64(seed);
        let limit = budget_mb as f64;
        let mut data_used = 0.0f64;
        let mut tested: HashSet<String> = HashSet::new();
        let mut survivors = 0usize;

        while data_used < limit && tested.len() < self.candidates.len() {
            let temperature = (1.0 - data_used / limit).clamp(0.0, 1.0);
            let range_size = ((self.candidates.len() as f64 * temperature).round() as usize)
                .clamp(1, self.candidates.len());

            // 随机挑一个未测过的；撞车 20 次后退化成线性扫描
            let mut chosen: Option<usize> = None;
            for _ in 0..20 {
                let idx = rng.random_range(0..range_size);
                if !tested.contains(&self.candidates[idx].proxy.fingerprint) {
                    chosen = Some(idx);
                    break;
                }
            }
            if chosen.is_none() {
                chosen = self
                    .candidates
                    .iter()
                    .position(|c| !tested.contains(&c.proxy.fingerprint));
            }
            let Some(idx) = chosen else {
                break;
            };

            let fingerprint = self.candidates[idx].proxy.fingerprint.clone();
            tested.insert(fingerprint.clone());
            debug!("正在测试：{}", short_link(&self.candidates[idx].proxy.raw));

            let outcome = prober.probe(&self.candidates[idx].proxy).await;

            data_used += outcome.bytes_downloaded as f64 / MIB;
            let mbps = if outcome.failed {
                data_used += FLAT_FAILURE_PENALTY_MB;
                0.0
            } else {
                outcome.mbps
            };

            self.history
                .update_history(&fingerprint, &self.env.isp, mbps, self.env.baseline_mbps)
                .await;

            if mbps > 0.0 {
                let normalized = if self.env.baseline_mbps > 0.0 {
                    mbps / self.env.baseline_mbps
                } else {
                    0.0
                };

                let candidate = &self.candidates[idx];
                for &cat_idx in &candidate.matching_categories {
                    let ctx = &mut self.categories[cat_idx];
                    if ctx.strategy.is_candidate(&candidate.proxy, &ctx.config.params) {
                        let score =
                            ctx.strategy.score(normalized, &candidate.proxy, &ctx.config.params);
                        if ctx.bucket.offer(candidate.proxy.clone(), score).is_accepted() {
                            survivors += 1;
                        }
                    }
                }
            }
        }

        info!(
            "🏁 退火结束：测了 {}/{} 个，耗费 {:.1} MiB",
            tested.len(),
            self.candidates.len(),
            data_used
        );

        self.save_categories().await;

        Ok(RunReport {
            data_used_mb: data_used,
            tested: tested.len(),
            survivors,
        })
    }

    /// 快速模式：跳过测量，按历史预测分直接分桶。
    pub async fn run_fast(&mut self) -> Result<RunReport, CoreError> {
        info!("⚡ 按历史成绩直接分配分类（不做新测量）...");

        let mut survivors = 0usize;
        for candidate in &self.candidates {
            for &cat_idx in &candidate.matching_categories {
                let ctx = &mut self.categories[cat_idx];
                let score = ctx.strategy.score(
                    candidate.predicted_score,
                    &candidate.proxy,
                    &ctx.config.params,
                );
                debug!(
                    "投递 {} 分值 {:.3}",
                    short_link(&candidate.proxy.raw),
                    score
                );
                if ctx.bucket.offer(candidate.proxy.clone(), score).is_accepted() {
                    survivors += 1;
                }
            }
        }

        self.save_categories().await;

        Ok(RunReport {
            data_used_mb: 0.0,
            tested: 0,
            survivors,
        })
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    async fn save_categories(&self) {
        info!("💾 正在保存分类结果...");
        for ctx in &self.categories {
            let fingerprints = ctx.bucket.fingerprints();
            match self
                .store
                .replace_category(&ctx.config.name, &fingerprints)
                .await
            {
                Ok(()) => info!("   -> {}: 保存 {} 个代理", ctx.config.name, fingerprints.len()),
                Err(e) => warn!("保存分类 {} 失败：{}", ctx.config.name, e),
            }
        }
    }
}

fn setup_category_contexts(
    categories: &[CategoryConfig],
    registry: &StrategyRegistry,
) -> Vec<CategoryContext> {
    let mut contexts = Vec::new();
    for cat in categories {
        match registry.get(&cat.strategy) {
            Ok(strategy) => contexts.push(CategoryContext {
                config: cat.clone(),
                strategy,
                bucket: Bucket::new(cat.bucket_size),
            }),
            Err(e) => warn!("跳过分类 {}：{}", cat.name, e),
        }
    }
    contexts
}

fn short_link(raw: &str) -> String {
    if raw.len() > 15 {
        format!("{}...", &raw[..12])
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定产出的打桩探测器。
    struct FixedProber {
        mbps: f64,
        bytes: u64,
        failed: bool,
        calls: AtomicUsize,
    }

    impl FixedProber {
        fn new(mbps: f64, bytes: u64, failed: bool) -> Self {
            Self {
                mbps,
                bytes,
                failed,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _proxy: &ProxyRecord) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ProbeOutcome {
                mbps: self.mbps,
                bytes_downloaded: self.bytes,
                failed: self.failed,
            }
        }
    }

    /// 每个指纹给不同速度的打桩探测器。
    struct MappedProber {
        speeds: HashMap<String, f64>,
        bytes: u64,
    }

    #[async_trait]
    impl Prober for MappedProber {
        async fn probe(&self, proxy: &ProxyRecord) -> ProbeOutcome {
            let mbps = self.speeds.get(&proxy.fingerprint).copied().unwrap_or(0.0);
            ProbeOutcome {
                mbps,
                bytes_downloaded: self.bytes,
                failed: mbps <= 0.0,
            }
        }
    }

    fn test_config(bucket_size: usize) -> AppConfig {
        AppConfig {
            database: DatabaseConfig::default(),
            system_proxy: Default::default(),
            tester: Default::default(),
            collectors: vec![],
            categories: vec![CategoryConfig {
                name: "speed".into(),
                strategy: "standard".into(),
                weight: 1,
                bucket_size,
                params: HashMap::new(),
            }],
            publishers: vec![],
        }
    }

    fn proxies(n: usize) -> Vec<ProxyRecord> {
        (0..n)
            .map(|i| {
                ProxyRecord::new(
                    format!("fp{:04}", i),
                    format!("trojan://pw@h{}.example:443", i),
                    "test".into(),
                    format!("h{}.example", i),
                    443,
                )
            })
            .collect()
    }

    fn env() -> Env {
        Env {
            isp: "ISP-X".into(),
            baseline_mbps: 10.0,
        }
    }

    async fn annealer(cfg: &AppConfig, alive: Vec<ProxyRecord>) -> Annealer {
        let store = ProxyStore::connect_memory().await.unwrap();
        let registry = StrategyRegistry::builtin();
        Annealer::new(store, cfg, env(), &registry, alive)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_budget_bounds_the_number_of_probes() {
        let cfg = test_config(20);
        let mut a = annealer(&cfg, proxies(1000)).await;

        // 每次测量正好 1 MiB，预算 10 MiB
        let prober = FixedProber::new(5.0, 1024 * 1024, false);
        let report = a.run(10, &prober, 42).await.unwrap();

        // 最后一次测量可以越过预算线，但之后必须停
        assert!(report.tested <= 11, "tested {} probes", report.tested);
        assert!(report.data_used_mb <= 11.0 + 1e-9);
        assert_eq!(prober.calls.load(Ordering::SeqCst), report.tested);
    }

    #[tokio::test]
    async fn test_failures_consume_flat_penalty() {
        let cfg = test_config(20);
        let mut a = annealer(&cfg, proxies(100)).await;

        // 失败不传字节，只吃罚金：2 MiB 预算 / 0.2 ≈ 10 次
        let prober = FixedProber::new(0.0, 0, true);
        let report = a.run(2, &prober, 7).await.unwrap();

        assert!(
            (10..=11).contains(&report.tested),
            "tested {} probes",
            report.tested
        );
        assert_eq!(report.survivors, 0);
        assert!(report.data_used_mb >= 2.0 - 1e-9);
        assert!(report.data_used_mb <= 2.2 + 1e-9);
    }

    #[tokio::test]
    async fn test_bucket_capacity_is_respected() {
        let cfg = test_config(3);
        let mut a = annealer(&cfg, proxies(50)).await;

        let prober = FixedProber::new(5.0, 64 * 1024, false);
        a.run(100, &prober, 1).await.unwrap();

        assert!(a.categories[0].bucket.len() <= 3);
    }

    #[tokio::test]
    async fn test_same_seed_replays_identical_buckets() {
        let cfg = test_config(5);
        let speeds: HashMap<String, f64> = (0..40)
            .map(|i| (format!("fp{:04}", i), (i % 13) as f64))
            .collect();

        let mut first: Option<Vec<String>> = None;
        for _ in 0..2 {
            let mut a = annealer(&cfg, proxies(40)).await;
            let prober = MappedProber {
                speeds: speeds.clone(),
                bytes: 256 * 1024,
            };
            a.run(5, &prober, 99).await.unwrap();

            let mut fps = a.categories[0].bucket.fingerprints();
            fps.sort();
            match &first {
                None => first = Some(fps),
                Some(expected) => assert_eq!(&fps, expected),
            }
        }
    }

    #[tokio::test]
    async fn test_every_candidate_tested_when_budget_is_ample() {
        let cfg = test_config(20);
        let mut a = annealer(&cfg, proxies(15)).await;

        let prober = FixedProber::new(5.0, 1024, false);
        let report = a.run(1000, &prober, 3).await.unwrap();

        assert_eq!(report.tested, 15);
    }

    #[tokio::test]
    async fn test_fast_mode_uses_predictive_scores() {
        let cfg = test_config(20);

        let store = ProxyStore::connect_memory().await.unwrap();
        let hist = HistoryEngine::new(store.clone());
        // 只有 fp0001 有历史
        hist.update_history("fp0001", "ISP-X", 8.0, 10.0).await;

        let registry = StrategyRegistry::builtin();
        let mut a = Annealer::new(store.clone(), &cfg, env(), &registry, proxies(3))
            .await
            .unwrap();
        a.run_fast().await.unwrap();

        let cats = store.load_categories(&["speed".to_string()]).await.unwrap();
        // 冷启动分也是正分，三个都进桶
        assert_eq!(cats.len(), 1);

        let fps = a.categories[0].bucket.fingerprints();
        assert_eq!(fps.len(), 3);
    }

    #[tokio::test]
    async fn test_dead_proxies_never_enter_buckets() {
        let cfg = test_config(20);
        let mut a = annealer(&cfg, proxies(10)).await;

        let mut speeds = HashMap::new();
        speeds.insert("fp0000".to_string(), 5.0);
        // 其余全部失败
        let prober = MappedProber {
            speeds,
            bytes: 1024,
        };
        a.run(100, &prober, 5).await.unwrap();

        let fps = a.categories[0].bucket.fingerprints();
        assert_eq!(fps, vec!["fp0000".to_string()]);
    }
}
