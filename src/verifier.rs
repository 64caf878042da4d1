//! 健康检查层：按批次并发探活全库代理。
//!
//! 一批共享同一个引擎实例，批内用信号量控制并发度。
//! 活着的代理顺手刷新出入口元数据，死掉的按衰减计入历史。

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::TesterConfig;
use crate::environment::Env;
use crate::error::CoreError;
use crate::geoip::GeoIp;
use crate::harness;
use crate::history::HistoryEngine;
use crate::metrics::Collector;
use crate::model::ProxyRecord;
use crate::parser;
use crate::store::ProxyStore;
use crate::tester::{AnalyzeResult, Tester};

pub async fn health_check_layer(
    store: &ProxyStore,
    hist: Arc<HistoryEngine>,
    cfg: &TesterConfig,
    env: &Env,
    geoip: Arc<GeoIp>,
    metrics: Option<Arc<Collector>>,
) -> Result<Vec<ProxyRecord>, CoreError> {
    let batch_size = cfg.worker_count.max(1);

    let all = store.all_proxies().await?;
    let total = all.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    info!("🔎 开始批量健康检查（批大小 {}，总数 {}）...", batch_size, total);

    let survivors: Arc<Mutex<Vec<ProxyRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let processed = Arc::new(AtomicUsize::new(0));

    for batch in all.chunks(batch_size) {
        // 整批解析，解析不了的链接当场淘汰
        let mut profiles = Vec::with_capacity(batch.len());
        for p in batch {
            match parser::parse(&p.raw) {
                Ok(profile) => profiles.push((p.fingerprint.clone(), profile)),
                Err(e) => {
                    debug!("丢弃无法解析的链接 {}: {}", p.fingerprint, e);
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let (port_map, instance) = match harness::start_multi_ephemeral(cfg, &profiles).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("批次启动失败：{}，跳过 {} 个代理", e, profiles.len());
                processed.fetch_add(profiles.len(), Ordering::SeqCst);
                continue;
            }
        };

        let sem = Arc::new(Semaphore::new(batch_size));
        let mut tasks = Vec::new();

        for proxy in batch {
            let Some(&port) = port_map.get(&proxy.fingerprint) else {
                processed.fetch_add(1, Ordering::SeqCst);
                continue;
            };

            let sem = sem.clone();
            let store = store.clone();
            let hist = hist.clone();
            let geoip = geoip.clone();
            let metrics = metrics.clone();
            let survivors = survivors.clone();
            let processed = processed.clone();
            let cfg = cfg.clone();
            let env = env.clone();
            let proxy = proxy.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                let tester = Tester::new(cfg.clone());

                let started = std::time::Instant::now();
                let outcome = async {
                    let client = tester.make_client(port, cfg.health_timeout())?;
                    tester.analyze(&client, &geoip).await
                }
                .await;

                match outcome {
                    Ok(meta) => {
                        if let Some(m) = &metrics {
                            m.record_success(started.elapsed());
                        }

                        let updated =
                            commit_metadata(&store, &tester, &geoip, &proxy, &meta).await;
                        survivors.lock().await.push(updated);
                    }
                    Err(e) => {
                        if let Some(m) = &metrics {
                            m.record_failure(&e);
                        }
                        // 探活失败按完全失败计入历史
                        hist.update_history(&proxy.fingerprint, &env.isp, 0.0, env.baseline_mbps)
                            .await;
                    }
                }

                let curr = processed.fetch_add(1, Ordering::SeqCst) + 1;
                let alive = survivors.lock().await.len();
                print_progress(curr, total, alive);
            }));
        }

        futures::future::join_all(tasks).await;
        instance.close().await;
    }

    eprintln!();
    let survivors = Arc::try_unwrap(survivors)
        .map(|m| m.into_inner())
        .unwrap_or_default();
    info!("✅ 健康检查完成，存活 {}/{}", survivors.len(), total);
    Ok(survivors)
}

/// 出口元数据套用到记录上。轮转标记只进不出：
/// 出口归属和上次观测不一致就钉死。
fn apply_exit_meta(proxy: &ProxyRecord, meta: &AnalyzeResult) -> ProxyRecord {
    let mut updated = proxy.clone();

    if !updated.is_rotating
        && !updated.isp.is_empty()
        && (updated.isp != meta.isp || updated.country != meta.country)
    {
        updated.is_rotating = true;
    }

    updated.ip = meta.ip.clone();
    updated.isp = meta.isp.clone();
    updated.country = meta.country.clone();
    updated.is_dirty = meta.is_dirty;
    updated
}

/// 写回出口元数据，入口元数据缺失时惰性补齐。
async fn commit_metadata(
    store: &ProxyStore,
    tester: &Tester,
    geoip: &GeoIp,
    proxy: &ProxyRecord,
    meta: &AnalyzeResult,
) -> ProxyRecord {
    let mut updated = apply_exit_meta(proxy, meta);

    if updated.entry_isp.is_empty() && !updated.address.is_empty() {
        if let Ok(entry) = tester.fetch_entry_meta(&updated.address, geoip).await {
            updated.entry_ip = entry.ip;
            updated.entry_isp = entry.isp;
            updated.entry_country = entry.country;
        }
    }

    if let Err(e) = store.update_metadata(&updated).await {
        tracing::error!("写回元数据失败 {}: {}", updated.fingerprint, e);
    }
    updated
}

fn print_progress(curr: usize, total: usize, alive: usize) {
    eprint!("\r🔎 已检查 {}/{} | 存活 {}    ", curr, total, alive);
    let _ = std::io::stderr().flush();
}
