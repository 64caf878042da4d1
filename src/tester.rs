use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::Client;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::config::TesterConfig;
use crate::engine::{ProbeOutcome, Prober};
use crate::error::CoreError;
use crate::geoip::GeoIp;
use crate::harness;
use crate::model::ProxyRecord;
use crate::parser;
use crate::store::ProxyStore;

/// 分析结果：通过代理（或直连）观测到的出口身份。
#[derive(Debug, Clone, Default)]
pub struct AnalyzeResult {
    pub ip: String,
    pub isp: String,
    pub country: String,
    pub is_dirty: bool,
}

/// 入口元数据：代理服务器自身的归属。
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub ip: String,
    pub isp: String,
    pub country: String,
}

struct SpeedSample {
    mbps: f64,
    bytes: u64,
    /// 流在 EOF 前断掉
    truncated: bool,
}

pub struct Tester {
    cfg: TesterConfig,
}

impl Tester {
    pub fn new(cfg: TesterConfig) -> Self {
        Self { cfg }
    }

    /// 经本地 SOCKS 入站的探测客户端。
    ///
    /// 三道独立超时：拨号、响应头、整请求。只有整请求超时
    /// 挡不住一个每几秒挤一个字节的慢代理。
    pub fn make_client(&self, port: u16, total: Duration) -> Result<Client, CoreError> {
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{}", port))?;
        let client = Client::builder()
            .proxy(proxy)
            .connect_timeout(self.cfg.health_timeout())
            .timeout(total)
            .build()?;
        Ok(client)
    }

    fn direct_client(&self, total: Duration) -> Result<Client, CoreError> {
        let client = Client::builder()
            .connect_timeout(self.cfg.health_timeout())
            .timeout(total)
            .build()?;
        Ok(client)
    }

    /// 轻量存活检查：echo 端点 2xx/3xx 即算活，返回耗时。
    pub async fn health_check(&self, client: &Client) -> Result<Duration, CoreError> {
        let start = Instant::now();
        let resp = self.get_with_header_deadline(client, &self.cfg.echo_url).await?;
        let status = resp.status().as_u16();
        if !(200..400).contains(&status) {
            return Err(CoreError::Probe(format!("health check status {}", status)));
        }
        Ok(start.elapsed())
    }

    /// 完整分析：echo 拿出口 IP → 本地 GeoIP 查归属 → 可选脏检。
    pub async fn analyze(&self, client: &Client, geoip: &GeoIp) -> Result<AnalyzeResult, CoreError> {
        let mut last_err = CoreError::Probe("no attempt".into());
        let mut ip = None;

        for attempt in 0..=self.cfg.retries {
            match self.fetch_echo_ip(client).await {
                Ok(observed) => {
                    ip = Some(observed);
                    break;
                }
                Err(e) => {
                    last_err = e;
                    if attempt < self.cfg.retries {
                        sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
        let ip = ip.ok_or(last_err)?;

        let geo = geoip.lookup(&ip)?;
        let mut result = AnalyzeResult {
            ip,
            isp: geo.isp,
            country: geo.country,
            is_dirty: false,
        };

        // 金丝雀 URL 打不开说明出口 IP 已经上了风控名单
        if !self.cfg.dirty_check_url.is_empty() {
            result.is_dirty = match self
                .get_with_header_deadline(client, &self.cfg.dirty_check_url)
                .await
            {
                Ok(resp) => resp.status().as_u16() != 200,
                Err(_) => true,
            };
        }

        Ok(result)
    }

    pub async fn analyze_direct(&self, geoip: &GeoIp) -> Result<AnalyzeResult, CoreError> {
        let client = self.direct_client(self.cfg.health_timeout())?;
        self.analyze(&client, geoip).await
    }

    /// 测速：响应头到达后才开始计时，TTFB 不算进吞吐。
    ///
    /// 半途断流的样本也有效，但会继续重试（500ms 间隔），
    /// 最终保留字节数最多的一次。
    pub async fn speed_check(&self, client: &Client) -> Result<(f64, u64), CoreError> {
        let mut best: Option<(f64, u64)> = None;
        let mut last_err = CoreError::Probe("no attempt".into());

        for attempt in 0..=self.cfg.retries {
            match self.speed_attempt(client).await {
                Ok(sample) => {
                    let better = match best {
                        Some((_, best_bytes)) => sample.bytes > best_bytes,
                        None => true,
                    };
                    if better {
                        best = Some((sample.mbps, sample.bytes));
                    }
                    if !sample.truncated {
                        break;
                    }
                }
                Err(e) => {
                    last_err = e;
                }
            }
            if attempt < self.cfg.retries {
                sleep(Duration::from_millis(500)).await;
            }
        }

        best.ok_or(last_err)
    }

    pub async fn speed_check_direct(&self) -> Result<(f64, u64), CoreError> {
        let client = self.direct_client(self.cfg.speed_timeout())?;
        self.speed_check(&client).await
    }

    async fn speed_attempt(&self, client: &Client) -> Result<SpeedSample, CoreError> {
        let resp = self
            .get_with_header_deadline(client, &self.cfg.speed_test_url)
            .await?;
        if resp.status().as_u16() != 200 {
            return Err(CoreError::Probe(format!(
                "speed test status {}",
                resp.status().as_u16()
            )));
        }

        // 从这里开始计时：头部已经到了
        let start = Instant::now();
        let mut bytes: u64 = 0;
        let mut stream = resp.bytes_stream();
        let mut stream_err = None;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => bytes += chunk.len() as u64,
                Err(e) => {
                    stream_err = Some(e);
                    break;
                }
            }
        }

        let duration = start.elapsed().as_secs_f64();
        if bytes == 0 {
            return match stream_err {
                Some(e) => Err(CoreError::HttpError(e)),
                None => Err(CoreError::Probe("empty speed test body".into())),
            };
        }
        if duration <= 0.0 {
            return Err(CoreError::Probe("download too fast to measure".into()));
        }

        // 传了一部分就断的也算有效样本
        Ok(SpeedSample {
            mbps: (bytes as f64 * 8.0) / (duration * 1_000_000.0),
            bytes,
            truncated: stream_err.is_some(),
        })
    }

    /// echo 端点约定：响应体就是裸 ASCII IP，允许尾部空白。
    async fn fetch_echo_ip(&self, client: &Client) -> Result<String, CoreError> {
        let resp = self.get_with_header_deadline(client, &self.cfg.echo_url).await?;
        if resp.status().as_u16() != 200 {
            return Err(CoreError::Probe(format!(
                "echo status {}",
                resp.status().as_u16()
            )));
        }
        let body = resp.text().await?;
        let ip = body.trim().to_string();
        if ip.is_empty() {
            return Err(CoreError::Probe("empty echo body".into()));
        }
        Ok(ip)
    }

    /// 响应头超时：reqwest 只有整请求超时，这里单独包一层。
    async fn get_with_header_deadline(
        &self,
        client: &Client,
        url: &str,
    ) -> Result<reqwest::Response, CoreError> {
        match timeout(self.cfg.health_timeout(), client.get(url).send()).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(CoreError::HttpError(e)),
            Err(_) => Err(CoreError::Probe("response header timeout".into())),
        }
    }

    /// 入口元数据：直连解析 address，再查本地 GeoIP。
    pub async fn fetch_entry_meta(&self, address: &str, geoip: &GeoIp) -> Result<EntryMeta, CoreError> {
        let ip = if address.parse::<std::net::IpAddr>().is_ok() {
            address.to_string()
        } else {
            let mut addrs = tokio::net::lookup_host((address, 0)).await?;
            match addrs.next() {
                Some(addr) => addr.ip().to_string(),
                None => return Err(CoreError::Probe(format!("dns no records for {}", address))),
            }
        };

        let geo = geoip.lookup(&ip)?;
        Ok(EntryMeta {
            ip,
            isp: geo.isp,
            country: geo.country,
        })
    }
}

/// 真实测量执行器：每个候选起一个临时实例，分析 + 测速，
/// 结果写回元数据，测量数据交还调度器。
pub struct CycleProber {
    tester: Tester,
    cfg: TesterConfig,
    geoip: Arc<GeoIp>,
    store: ProxyStore,
    /// fast 模式跳过分析，只测速
    pub skip_analyze: bool,
}

impl CycleProber {
    pub fn new(cfg: TesterConfig, geoip: Arc<GeoIp>, store: ProxyStore) -> Self {
        Self {
            tester: Tester::new(cfg.clone()),
            cfg,
            geoip,
            store,
            skip_analyze: false,
        }
    }

    async fn run_cycle(&self, proxy: &ProxyRecord) -> Result<(f64, u64), CoreError> {
        let profile = parser::parse(&proxy.raw)?;
        let (port, instance) =
            harness::start_ephemeral(&self.cfg, &proxy.fingerprint, &profile).await?;

        let result = self.probe_on_port(proxy, port).await;
        instance.close().await;
        result
    }

    async fn probe_on_port(&self, proxy: &ProxyRecord, port: u16) -> Result<(f64, u64), CoreError> {
        // 分析先行，测速在后；同一候选内部是串行的
        if !self.skip_analyze {
            let client = self.tester.make_client(port, self.cfg.health_timeout())?;
            match self.tester.analyze(&client, &self.geoip).await {
                Ok(meta) => self.commit_exit_meta(proxy, &meta).await,
                Err(e) => debug!("分析失败 {}: {}", proxy.fingerprint, e),
            }
        }

        let speed_client = self.tester.make_client(port, self.cfg.speed_timeout())?;
        self.tester.speed_check(&speed_client).await
    }

    /// 刷新出口元数据；出口归属变了就把轮转标记钉死。
    async fn commit_exit_meta(&self, proxy: &ProxyRecord, meta: &AnalyzeResult) {
        let mut updated = match self.store.find_proxy(&proxy.fingerprint).await {
            Ok(Some(p)) => p,
            _ => proxy.clone(),
        };

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

        if let Err(e) = self.store.update_metadata(&updated).await {
            tracing::error!("写回元数据失败 {}: {}", proxy.fingerprint, e);
        }
    }
}

#[async_trait::async_trait]
impl Prober for CycleProber {
    async fn probe(&self, proxy: &ProxyRecord) -> ProbeOutcome {
        match self.run_cycle(proxy).await {
            Ok((mbps, bytes)) => ProbeOutcome {
                mbps,
                bytes_downloaded: bytes,
                failed: false,
            },
            Err(e) => {
                debug!("测量失败 {}: {}", proxy.fingerprint, e);
                ProbeOutcome {
                    mbps: 0.0,
                    bytes_downloaded: 0,
                    failed: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_client_rejects_nothing_sane() {
        let tester = Tester::new(TesterConfig::default());
        assert!(tester.make_client(1080, Duration::from_secs(5)).is_ok());
    }
}
