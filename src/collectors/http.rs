use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CoreError;
use crate::parser::links;

use super::{param_str, param_u64, Collector, Params};

/// 通用 HTTP 采集器：抓一个 URL，把正文里的链接全部抠出来。
/// 订阅页、裸文本列表、base64 整包都能吃。
pub struct HttpCollector;

#[async_trait]
impl Collector for HttpCollector {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn collect(&self, params: &Params) -> Result<Vec<String>, CoreError> {
        let url = param_str(params, "url")
            .ok_or_else(|| anyhow::anyhow!("missing 'url' in collector config"))?;

        let timeout = Duration::from_secs(param_u64(params, "_timeout").unwrap_or(120));
        let retries = param_u64(params, "_retries").unwrap_or(0);

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = param_str(params, "_proxy_url") {
            debug!("HTTP 采集器走代理：{}", proxy_url);
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        let client = builder.build()?;

        let mut last_err: Option<CoreError> = None;
        for attempt in 0..=retries {
            debug!("抓取 {}（第 {} 次）", url, attempt + 1);
            match fetch_body(&client, url).await {
                Ok(body) => return Ok(links::extract_links(&body)),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::Probe("no attempt".into())))
    }
}

async fn fetch_body(client: &reqwest::Client, url: &str) -> Result<String, CoreError> {
    let resp = client.get(url).send().await?;
    let status = resp.status().as_u16();
    if status != 200 {
        return Err(CoreError::Probe(format!("non-200 status code: {}", status)));
    }
    Ok(resp.text().await?)
}
