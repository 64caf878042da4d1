use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;
use crate::model::Category;

use super::util::generate_subscription_payload;
use super::{Params, Publisher};

/// 通过 contents API 把订阅写进仓库文件。
/// 名字叫 github，实际兼容 Gitea / GitHub Enterprise（api_url 可配）。
pub struct GithubPublisher;

#[derive(Serialize)]
struct FileRequest<'a> {
    message: &'a str,
    /// base64 编码后的文件内容
    content: String,
    #[serde(skip_serializing_if = "ref_str_empty")]
    sha: &'a str,
    #[serde(skip_serializing_if = "ref_str_empty")]
    branch: &'a str,
}

fn ref_str_empty(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Deserialize)]
struct FileResponse {
    sha: String,
}

#[async_trait]
impl Publisher for GithubPublisher {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn publish(&self, categories: &[Category], params: &Params) -> Result<(), CoreError> {
        let payload = generate_subscription_payload(categories, params)?;

        let get = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let token = get("token");
        let owner = get("owner");
        let repo = get("repo");
        let path = get("path");
        let branch = get("branch");
        let mut message = get("message");

        let mut api_base = get("api_url");
        if api_base.is_empty() {
            api_base = "https://api.github.com".to_string();
        }
        let api_base = api_base.trim_end_matches('/');

        if token.is_empty() || owner.is_empty() || repo.is_empty() || path.is_empty() {
            return Err(anyhow::anyhow!(
                "git publisher requires token, owner, repo, and path"
            )
            .into());
        }
        if message.is_empty() {
            message = "Update proxy subscription".to_string();
        }

        let timeout = params
            .get("_timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(30);

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout));
        if let Some(proxy_url) = params.get("_proxy_url").and_then(|v| v.as_str()) {
            if !proxy_url.is_empty() {
                debug!("Git 发布器走代理：{}", proxy_url);
                builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
            }
        }
        let client = builder.build()?;

        let api_url = format!(
            "{}/repos/{}/{}/contents/{}",
            api_base,
            owner,
            repo,
            path.trim_start_matches('/')
        );

        // 先拿现有文件的 sha（更新必须带上）
        let mut request = client
            .get(&api_url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json");
        if !branch.is_empty() {
            request = request.query(&[("ref", branch.as_str())]);
        }

        debug!("Git: 查询文件信息 {}", api_url);
        let resp = request.send().await?;
        let current_sha = match resp.status().as_u16() {
            200 => {
                let existing: FileResponse = resp.json().await?;
                debug!("Git: 文件已存在 (sha {})，执行更新", existing.sha);
                existing.sha
            }
            404 => {
                debug!("Git: 文件不存在，执行创建");
                String::new()
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow::anyhow!("git get error ({}): {}", status, body).into());
            }
        };

        let body = FileRequest {
            message: &message,
            content: STANDARD.encode(&payload),
            sha: &current_sha,
            branch: &branch,
        };

        let resp = client
            .put(&api_url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("git api error ({}): {}", status, body).into());
        }

        Ok(())
    }
}
