use tracing::info;

use crate::categories::StrategyRegistry;
use crate::config::AppConfig;
use crate::error::CoreError;
use crate::history::HistoryEngine;
use crate::store::ProxyStore;

use super::priority::global_priority;

/// 数据库超过容量上限时，按全局优先级淘汰最没价值的代理。
///
/// custom_limit 为 0 时用配置里的 max_proxies。
pub async fn prune_database(
    store: &ProxyStore,
    cfg: &AppConfig,
    registry: &StrategyRegistry,
    observer_isp: &str,
    custom_limit: u32,
) -> Result<u64, CoreError> {
    let mut limit = custom_limit;
    if limit == 0 {
        limit = cfg.database.max_proxies;
    }
    if limit == 0 {
        limit = 10_000;
    }

    let count = store.count_proxies().await?;
    if count <= limit as i64 {
        return Ok(0);
    }

    let excess = (count - limit as i64) as usize;
    info!(
        "✂️  开始清理：{} 条超过上限 {}，将删除 {} 条...",
        count, limit, excess
    );

    let hist = HistoryEngine::new(store.clone());
    let all = store.all_proxies().await?;

    let mut scored = Vec::with_capacity(all.len());
    for proxy in all {
        let score =
            global_priority(&proxy, &hist, observer_isp, &cfg.categories, registry).await;
        scored.push((proxy.fingerprint, score));
    }

    // 升序：分最低的先走
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));

    let doomed: Vec<String> = scored.into_iter().take(excess).map(|(fp, _)| fp).collect();
    let deleted = store.delete_proxies(&doomed).await?;
    info!("✨ 清理完成，删除 {} 条", deleted);
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategoryConfig, DatabaseConfig};
    use crate::model::ProxyRecord;

    fn config_with_limit(limit: u32) -> AppConfig {
        AppConfig {
            database: DatabaseConfig {
                path: String::new(),
                max_proxies: limit,
            },
            system_proxy: Default::default(),
            tester: Default::default(),
            collectors: vec![],
            categories: vec![CategoryConfig {
                name: "speed".into(),
                strategy: "standard".into(),
                weight: 1,
                bucket_size: 20,
                params: Default::default(),
            }],
            publishers: vec![],
        }
    }

    #[tokio::test]
    async fn test_prune_keeps_highest_priority() {
        let store = ProxyStore::connect_memory().await.unwrap();
        let cfg = config_with_limit(2);
        let registry = StrategyRegistry::builtin();

        let batch: Vec<ProxyRecord> = (0..4)
            .map(|i| {
                ProxyRecord::new(
                    format!("fp{}", i),
                    format!("trojan://pw@h{}:443", i),
                    "test".into(),
                    format!("h{}", i),
                    443,
                )
            })
            .collect();
        store.insert_proxies(&batch).await.unwrap();

        // fp2 和 fp3 有好成绩，fp0/fp1 保持冷启动分
        let hist = HistoryEngine::new(store.clone());
        hist.update_history("fp2", "ISP-X", 9.0, 10.0).await;
        hist.update_history("fp3", "ISP-X", 8.0, 10.0).await;

        let deleted = prune_database(&store, &cfg, &registry, "ISP-X", 0)
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        assert!(store.find_proxy("fp2").await.unwrap().is_some());
        assert!(store.find_proxy("fp3").await.unwrap().is_some());
        assert!(store.find_proxy("fp0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_noop_under_limit() {
        let store = ProxyStore::connect_memory().await.unwrap();
        let cfg = config_with_limit(100);
        let registry = StrategyRegistry::builtin();

        store
            .insert_proxies(&[ProxyRecord::new(
                "fp".into(),
                "trojan://pw@h:443".into(),
                "test".into(),
                "h".into(),
                443,
            )])
            .await
            .unwrap();

        let deleted = prune_database(&store, &cfg, &registry, "ISP-X", 0)
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }
}
