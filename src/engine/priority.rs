use crate::categories::StrategyRegistry;
use crate::config::CategoryConfig;
use crate::history::HistoryEngine;
use crate::model::ProxyRecord;

/// 全局优先级 = 预测分 × 命中分类的权重之和。
///
/// 一个分类都不命中的代理没有测量价值，优先级为 0。
/// 权重按命中分类累加，覆盖面广的代理被优先测量。
pub async fn global_priority(
    proxy: &ProxyRecord,
    hist: &HistoryEngine,
    observer_isp: &str,
    categories: &[CategoryConfig],
    registry: &StrategyRegistry,
) -> f64 {
    let mut total_weight = 0.0;
    let mut matches_any = false;

    for cat in categories {
        let Ok(strategy) = registry.get(&cat.strategy) else {
            continue;
        };
        if strategy.is_candidate(proxy, &cat.params) {
            total_weight += cat.weight as f64;
            matches_any = true;
        }
    }

    if !matches_any {
        return 0.0;
    }

    let predicted = hist.predictive_score(&proxy.fingerprint, observer_isp).await;
    predicted * total_weight
}
