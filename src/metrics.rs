//! 调参报告：收集探测延迟与失败类型，给出超时和并发度的调整建议。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CoreError;

#[derive(Default)]
struct Inner {
    latencies: Vec<Duration>,
    total_success: u32,
    error_counts: HashMap<&'static str, u32>,
    total_errors: u32,
    timeout_errors: u32,
}

#[derive(Default)]
pub struct Collector {
    inner: Mutex<Inner>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.latencies.push(duration);
        inner.total_success += 1;
    }

    pub fn record_failure(&self, err: &CoreError) {
        let mut inner = self.inner.lock().expect("metrics poisoned");
        inner.total_errors += 1;

        let msg = err.to_string().to_lowercase();
        let kind = if msg.contains("timeout") || msg.contains("deadline") {
            inner.timeout_errors += 1;
            "Timeout (Slow)"
        } else if msg.contains("refused") {
            "Conn Refused (Fast)"
        } else if msg.contains("reset") {
            "Conn Reset (Fast)"
        } else if msg.contains("eof") || msg.contains("empty") {
            "EOF / Empty"
        } else if msg.contains("dns") || msg.contains("resolve") {
            "DNS Error"
        } else {
            "Unknown"
        };
        *inner.error_counts.entry(kind).or_insert(0) += 1;
    }

    /// 打印调参面板。探测全部结束后调用一次。
    pub fn print_report(&self, current_timeout: Duration, worker_count: usize) {
        let mut inner = self.inner.lock().expect("metrics poisoned");

        println!("\n📊 调参报告");
        println!("────────────────────────────────────────");

        if !inner.latencies.is_empty() {
            inner.latencies.sort_unstable();
            let p50 = inner.latencies[inner.latencies.len() / 2];
            let p90 = inner.latencies[(inner.latencies.len() as f64 * 0.9) as usize];
            let avg = inner
                .latencies
                .iter()
                .sum::<Duration>()
                .checked_div(inner.latencies.len() as u32)
                .unwrap_or_default();

            println!("[ 存活代理延迟 ]");
            println!("  平均耗时:  {:?}", avg);
            println!("  p50:       {:?}", p50);
            println!("  p90:       {:?}", p90);
            let recommended = p90 + Duration::from_millis(500);
            println!(
                "  💡 建议把 health_timeout 调到 ~{}s（当前 {}s）",
                recommended.as_secs().max(1),
                current_timeout.as_secs()
            );
            println!();
        }

        println!("[ 网络健康 / 错误 ]");
        println!("  成功: {}  失败: {}", inner.total_success, inner.total_errors);

        if inner.total_errors > 0 {
            let timeout_pct =
                inner.timeout_errors as f64 / inner.total_errors as f64 * 100.0;
            println!("  超时(疑似拥塞): {} ({:.1}%)", inner.timeout_errors, timeout_pct);

            let mut kinds: Vec<(&&str, &u32)> = inner.error_counts.iter().collect();
            kinds.sort_by_key(|(k, _)| **k);
            for (kind, count) in kinds {
                if *kind != "Timeout (Slow)" {
                    println!("  {}: {}", kind, count);
                }
            }

            println!("  --------------------------------");
            if timeout_pct > 70.0 {
                println!("  ⚠️  超时占失败的 70% 以上，本地带宽或 NAT 表可能已经打满");
                println!("  💡 建议调低 worker_count（当前 {}）", worker_count);
            } else {
                println!("  ✅ 网络状态正常（失败多为对端主动拒绝）");
            }
        }
        println!();
    }
}
