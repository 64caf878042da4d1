use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::TesterConfig;
use crate::error::CoreError;
use crate::parser::Profile;

use super::convert::to_outbound;

/// 一批临时入站的持有句柄。关闭即终止引擎进程和所有入站监听。
pub struct EphemeralInstance {
    child: Option<Child>,
}

impl EphemeralInstance {
    /// 显式关闭。句柄被 drop 时进程也会被回收（kill_on_drop）。
    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// 单个 Profile 的便捷入口。
pub async fn start_ephemeral(
    cfg: &TesterConfig,
    fingerprint: &str,
    profile: &Profile,
) -> Result<(u16, EphemeralInstance), CoreError> {
    let batch = [(fingerprint.to_string(), profile.clone())];
    let (ports, instance) = start_multi_ephemeral(cfg, &batch).await?;
    let port = ports
        .get(fingerprint)
        .copied()
        .ok_or(CoreError::EmptyBatch)?;
    Ok((port, instance))
}

/// 为一批 Profile 启动一个共享引擎实例。
///
/// 引擎启动成本在短探测里占大头，整批共享一个进程把它摊薄。
/// 返回 指纹→本地端口 的映射；端口分配存在竞态窗口，
/// 启动失败时换一批端口重试一次。
pub async fn start_multi_ephemeral(
    cfg: &TesterConfig,
    profiles: &[(String, Profile)],
) -> Result<(HashMap<String, u16>, EphemeralInstance), CoreError> {
    if profiles.is_empty() {
        return Err(CoreError::EmptyBatch);
    }

    match try_start(cfg, profiles).await {
        Ok(ok) => Ok(ok),
        Err(CoreError::EmptyBatch) => Err(CoreError::EmptyBatch),
        Err(first_err) => {
            warn!("引擎启动失败（{}），换端口重试一次", first_err);
            try_start(cfg, profiles).await
        }
    }
}

async fn try_start(
    cfg: &TesterConfig,
    profiles: &[(String, Profile)],
) -> Result<(HashMap<String, u16>, EphemeralInstance), CoreError> {
    // 先做整批结构校验，坏的丢掉
    let mut valid: Vec<(&String, serde_json::Value)> = Vec::new();
    for (i, (fingerprint, profile)) in profiles.iter().enumerate() {
        match to_outbound(profile, &format!("out_{}", i)) {
            Ok(outbound) => valid.push((fingerprint, outbound)),
            Err(e) => debug!("跳过无效配置 {}: {}", fingerprint, e),
        }
    }
    if valid.is_empty() {
        return Err(CoreError::EmptyBatch);
    }

    // 整批端口一次性分配，避免逐个往返
    let ports = free_ports(valid.len())?;

    let mut inbounds = Vec::with_capacity(valid.len());
    let mut outbounds = Vec::with_capacity(valid.len());
    let mut rules = Vec::with_capacity(valid.len());
    let mut port_map = HashMap::with_capacity(valid.len());

    for (i, ((fingerprint, outbound), port)) in valid.into_iter().zip(&ports).enumerate() {
        let tag_in = format!("in_{}", i);
        let tag_out = outbound["tag"].as_str().unwrap_or_default().to_string();

        inbounds.push(json!({
            "tag": tag_in.clone(),
            "listen": "127.0.0.1",
            "port": port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true },
        }));
        rules.push(json!({
            "type": "field",
            "inboundTag": [tag_in],
            "outboundTag": tag_out,
        }));
        outbounds.push(outbound);
        port_map.insert(fingerprint.clone(), *port);
    }

    let engine_config = json!({
        "log": {
            "loglevel": "none",
            "access": "none",
            "error": "none",
        },
        "inbounds": inbounds,
        "outbounds": outbounds,
        "routing": { "rules": rules },
    });

    let child = spawn_engine(cfg, &engine_config).await?;
    Ok((port_map, EphemeralInstance { child: Some(child) }))
}

async fn spawn_engine(
    cfg: &TesterConfig,
    engine_config: &serde_json::Value,
) -> Result<Child, CoreError> {
    // 引擎往进程级 stdout/stderr 写日志，全部丢弃，别污染前台输出
    let mut child = Command::new(&cfg.engine_bin)
        .args(["run", "-config", "stdin:"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::EngineStartup(format!("spawn {}: {}", cfg.engine_bin, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        let body = serde_json::to_vec(engine_config)
            .map_err(|e| CoreError::EngineStartup(e.to_string()))?;
        stdin
            .write_all(&body)
            .await
            .map_err(|e| CoreError::EngineStartup(format!("write config: {}", e)))?;
        // 关闭 stdin，引擎才会开始解析配置
    }

    // 给引擎一点时间绑定端口；这期间退出说明配置或端口有问题
    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Ok(Some(status)) = child.try_wait() {
        return Err(CoreError::EngineStartup(format!(
            "engine exited early: {}",
            status
        )));
    }

    Ok(child)
}

/// 找 n 个空闲回环端口：绑定 :0 拿内核分配的端口号，随后立刻释放。
fn free_ports(count: usize) -> Result<Vec<u16>, CoreError> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);

    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        ports.push(listener.local_addr()?.port());
        listeners.push(listener);
    }

    drop(listeners);
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_free_ports_are_distinct() {
        let ports = free_ports(16).unwrap();
        let unique: std::collections::HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), 16);
        assert!(ports.iter().all(|&p| p > 0));
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let cfg = TesterConfig::default();
        assert!(matches!(
            start_multi_ephemeral(&cfg, &[]).await,
            Err(CoreError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn test_batch_of_only_invalid_profiles_is_rejected() {
        let cfg = TesterConfig::default();
        // REALITY 缺 pbk/sid，结构校验过不去
        let p = parse("vless://uuid@h.example:443?security=reality").unwrap();
        let batch = [("fp".to_string(), p)];
        assert!(matches!(
            start_multi_ephemeral(&cfg, &batch).await,
            Err(CoreError::EmptyBatch)
        ));
    }
}
