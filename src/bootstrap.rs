//! 自举代理管理器：从已有的分类结果里赛马挑一个还活着的代理，
//! 给采集器和发布器自己的网络请求当跳板。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::TesterConfig;
use crate::harness::{self, EphemeralInstance};
use crate::parser;
use crate::store::ProxyStore;
use crate::tester::Tester;

/// 同批竞速的候选上限，再多容易耗尽本地端口。
const RACE_LIMIT: usize = 20;

pub struct BootstrapManager {
    store: ProxyStore,
    cfg: TesterConfig,
    category: String,
    fallback: String,
    current: Option<EphemeralInstance>,
}

impl BootstrapManager {
    pub fn new(store: ProxyStore, cfg: TesterConfig, category: String, fallback: String) -> Self {
        Self {
            store,
            cfg,
            category,
            fallback,
            current: None,
        }
    }

    /// 返回可用的本地 SOCKS 地址；全军覆没时退回配置的 fallback。
    pub async fn get_proxy(&mut self) -> Option<String> {
        let target = if self.category.is_empty() {
            "speed".to_string()
        } else {
            self.category.clone()
        };

        let members = match self.store.load_categories(&[target.clone()]).await {
            Ok(mut cats) if !cats.is_empty() => std::mem::take(&mut cats[0].members),
            _ => Vec::new(),
        };
        if members.is_empty() {
            debug!("分类 {} 暂无成员，使用 fallback", target);
            return self.fallback_proxy();
        }

        let mut profiles = Vec::new();
        for proxy in members.iter().take(RACE_LIMIT) {
            if let Ok(profile) = parser::parse(&proxy.raw) {
                profiles.push((proxy.fingerprint.clone(), profile));
            }
        }

        let (port_map, instance) = match harness::start_multi_ephemeral(&self.cfg, &profiles).await
        {
            Ok(ok) => ok,
            Err(e) => {
                warn!("自举批次启动失败：{}，使用 fallback", e);
                return self.fallback_proxy();
            }
        };

        match race_first_alive(&self.cfg, port_map.values().copied().collect()).await {
            Some(port) => {
                self.current = Some(instance);
                info!("🚀 自举代理就绪：本地端口 {}", port);
                Some(format!("socks5://127.0.0.1:{}", port))
            }
            None => {
                instance.close().await;
                warn!("分类 {} 里没有活着的代理，使用 fallback", target);
                self.fallback_proxy()
            }
        }
    }

    fn fallback_proxy(&self) -> Option<String> {
        if self.fallback.is_empty() {
            None
        } else {
            Some(self.fallback.clone())
        }
    }

    pub async fn stop(&mut self) {
        if let Some(instance) = self.current.take() {
            instance.close().await;
        }
    }
}

/// 并发竞速：所有端口同时探活，第一个成功的胜出。
async fn race_first_alive(cfg: &TesterConfig, ports: Vec<u16>) -> Option<u16> {
    let (tx, mut rx) = mpsc::channel::<u16>(1);
    let done = Arc::new(AtomicBool::new(false));

    for port in ports {
        let tx = tx.clone();
        let done = done.clone();
        let cfg = cfg.clone();

        tokio::spawn(async move {
            let tester = Tester::new(cfg.clone());
            for attempt in 0..=cfg.retries {
                // 有人赢了就别再白费流量
                if done.load(Ordering::SeqCst) {
                    return;
                }

                let alive = match tester.make_client(port, cfg.health_timeout()) {
                    Ok(client) => tester.health_check(&client).await.is_ok(),
                    Err(_) => false,
                };

                if alive {
                    if tx.try_send(port).is_ok() {
                        done.store(true, Ordering::SeqCst);
                    }
                    return;
                }
                if attempt < cfg.retries {
                    sleep(Duration::from_millis(200)).await;
                }
            }
        });
    }
    drop(tx);

    // 所有探测都失败时 sender 全部关闭，recv 返回 None
    rx.recv().await
}
