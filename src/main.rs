mod bootstrap;
mod categories;
mod collectors;
mod config;
mod engine;
mod environment;
mod error;
mod geoip;
mod harness;
mod history;
mod logging;
mod metrics;
mod model;
mod parser;
mod publishers;
mod store;
mod tester;
mod verifier;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{error, info, warn};

use crate::bootstrap::BootstrapManager;
use crate::categories::StrategyRegistry;
use crate::collectors::CollectorRegistry;
use crate::config::AppConfig;
use crate::engine::annealer::Annealer;
use crate::engine::pruner::prune_database;
use crate::geoip::GeoIp;
use crate::history::HistoryEngine;
use crate::metrics::Collector;
use crate::model::ProxyRecord;
use crate::publishers::{flag_emoji, PublisherRegistry};
use crate::store::ProxyStore;
use crate::tester::CycleProber;

#[derive(Parser)]
#[command(name = "proxyforge", version, about = "代理链接采集、测试与订阅发布流水线")]
struct Cli {
    /// 配置文件路径（默认 ./config.yaml）
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// 日志写入文件（覆盖旧文件）
    #[arg(long, global = true)]
    log_file: Option<String>,

    /// 禁用自举代理
    #[arg(long, global = true)]
    no_proxy: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 运行采集器抓取代理链接
    Collect {
        /// 只跑这些采集器（按名称）
        names: Vec<String>,
        /// 从标准输入读取链接
        #[arg(long)]
        stdin: bool,
        /// 覆盖采集器参数，如 -p url=https://x/sub
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// 健康检查 + 退火优化，填充分类
    Test {
        /// 只优化这些分类（按名称）
        categories: Vec<String>,
        #[arg(long)]
        workers: Option<usize>,
        /// 数据预算（MiB）
        #[arg(long)]
        budget: Option<u32>,
        /// 跳过健康检查与分析，直接测速
        #[arg(long)]
        fast: bool,
        /// 结束后打印调参报告
        #[arg(long)]
        report: bool,
        /// 固定随机种子（可复现运行）
        #[arg(long)]
        seed: Option<u64>,
    },
    /// 把分类结果发布成订阅
    Publish {
        names: Vec<String>,
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// 查看数据库状态面板
    Status,
    /// 清理数据库里最没价值的代理
    Prune {
        /// 自定义保留上限（0 = 用配置里的 max_proxies）
        #[arg(long, default_value_t = 0)]
        limit: u32,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// CLI 传入的字符串参数，数字样子的转成数字（和配置文件里的类型对齐）。
fn override_params(params: &mut HashMap<String, serde_json::Value>, overrides: &[(String, String)]) {
    for (k, v) in overrides {
        let value = match v.parse::<i64>() {
            Ok(n) => serde_json::json!(n),
            Err(_) => serde_json::json!(v),
        };
        params.insert(k.clone(), value);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.log_file.as_deref())?;

    let mut cfg = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Collect {
            names,
            stdin,
            params,
        } => run_collect(&mut cfg, names, stdin, params, cli.no_proxy).await?,
        Command::Test {
            categories,
            workers,
            budget,
            fast,
            report,
            seed,
        } => run_test(&mut cfg, categories, workers, budget, fast, report, seed).await?,
        Command::Publish { names, params } => {
            run_publish(&mut cfg, names, params, cli.no_proxy).await?
        }
        Command::Status => run_status(&cfg).await?,
        Command::Prune { limit } => run_prune(&cfg, limit).await?,
    }

    Ok(())
}

async fn run_collect(
    cfg: &mut AppConfig,
    names: Vec<String>,
    stdin: bool,
    params: Vec<(String, String)>,
    no_proxy: bool,
) -> anyhow::Result<()> {
    let store = ProxyStore::connect(&cfg.database.path).await?;

    if stdin {
        info!("📥 从标准输入读取代理链接...");
        let mut data = String::new();
        std::io::stdin().read_to_string(&mut data)?;

        let links = parser::links::extract_links(&data);
        if links.is_empty() {
            warn!("标准输入里没有有效链接");
            return Ok(());
        }

        let count = save_proxies(&store, &links, "stdin").await?;
        info!("✅ 导入完成，入库 {} 条", count);
        return Ok(());
    }

    cfg.filter_collectors(&names);
    if cfg.collectors.is_empty() {
        warn!("没有匹配的采集器");
        return Ok(());
    }

    for collector_cfg in &mut cfg.collectors {
        collector_cfg.params.insert(
            "_timeout".to_string(),
            serde_json::json!(cfg.tester.speed_timeout),
        );
        collector_cfg.params.insert(
            "_retries".to_string(),
            serde_json::json!(cfg.tester.retries),
        );
        override_params(&mut collector_cfg.params, &params);
    }

    let mut manager = system_proxy_manager(cfg, &store, no_proxy);
    let active_proxy = match &mut manager {
        Some(m) => m.get_proxy().await,
        None => None,
    };
    if let Some(addr) = &active_proxy {
        info!("🚀 采集流量走代理：{}", addr);
    }

    let registry = CollectorRegistry::builtin();
    for collector_cfg in &cfg.collectors {
        info!("🏃 运行采集器 {}（{}）...", collector_cfg.name, collector_cfg.kind);

        let collector = match registry.get(&collector_cfg.kind) {
            Ok(c) => c,
            Err(e) => {
                warn!("跳过：{}", e);
                continue;
            }
        };

        let mut run_params = collector_cfg.params.clone();
        if let Some(addr) = &active_proxy {
            run_params.insert("_proxy_url".to_string(), serde_json::json!(addr));
        }

        match collector.collect(&run_params).await {
            Ok(links) => {
                let count = save_proxies(&store, &links, &collector_cfg.name).await?;
                info!("✅ 采集器 {} 完成，入库 {} 条", collector_cfg.name, count);
            }
            Err(e) => error!("采集器 {} 出错：{}", collector_cfg.name, e),
        }
    }

    if let Some(mut m) = manager {
        m.stop().await;
    }
    Ok(())
}

/// 解析、指纹、批量入库。解析不动的链接直接丢弃。
async fn save_proxies(
    store: &ProxyStore,
    links: &[String],
    source: &str,
) -> anyhow::Result<u64> {
    let mut batch = Vec::new();
    for raw in links {
        let profile = match parser::parse(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("丢弃链接：{}", e);
                continue;
            }
        };

        batch.push(ProxyRecord::new(
            profile.fingerprint_hash(),
            raw.clone(),
            source.to_string(),
            profile.address.clone(),
            profile.port,
        ));
    }

    if batch.is_empty() {
        return Ok(0);
    }
    Ok(store.insert_proxies(&batch).await?)
}

async fn run_test(
    cfg: &mut AppConfig,
    categories: Vec<String>,
    workers: Option<usize>,
    budget: Option<u32>,
    fast: bool,
    report: bool,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    if let Some(w) = workers {
        cfg.tester.worker_count = w;
    }
    if let Some(b) = budget {
        cfg.tester.anneal_budget_mb = b;
    }
    cfg.filter_categories(&categories);

    let store = ProxyStore::connect(&cfg.database.path).await?;
    // ASN 库缺失直接失败：没有它整条评分链路都是瞎的
    let geoip = Arc::new(GeoIp::open(
        &cfg.tester.geoip_asn_path,
        &cfg.tester.geoip_country_path,
    )?);

    let env = environment::detect(&cfg.tester, &geoip).await;

    let hist = Arc::new(HistoryEngine::new(store.clone()));
    let metrics = report.then(|| Arc::new(Collector::new()));

    let candidates = if fast {
        info!("⏩ 快速模式：跳过全量健康检查");
        store.all_proxies().await?
    } else {
        verifier::health_check_layer(
            &store,
            hist.clone(),
            &cfg.tester,
            &env,
            geoip.clone(),
            metrics.clone(),
        )
        .await?
    };

    if candidates.is_empty() {
        error!("❌ 没有可用候选，结束");
        return Ok(());
    }

    let registry = StrategyRegistry::builtin();
    let mut annealer =
        Annealer::new(store.clone(), cfg, env.clone(), &registry, candidates).await?;
    if annealer.candidate_count() == 0 {
        error!("❌ 没有候选命中任何分类，结束");
        return Ok(());
    }

    let mut prober = CycleProber::new(cfg.tester.clone(), geoip, store.clone());
    prober.skip_analyze = fast;

    let seed = seed.unwrap_or_else(|| rand::rng().random());
    annealer
        .run(cfg.tester.anneal_budget_mb, &prober, seed)
        .await?;

    // 完整测试之后把库压到上限的七成，给下一轮新代理腾位置
    if !fast {
        let aggressive = (cfg.database.max_proxies as f64 * 0.7) as u32;
        info!("🧹 测试后清理（目标 {}）...", aggressive);
        if let Err(e) = prune_database(&store, cfg, &registry, &env.isp, aggressive).await {
            error!("清理失败：{}", e);
        }
    }

    if let Some(m) = metrics {
        m.print_report(cfg.tester.health_timeout(), cfg.tester.worker_count);
    }
    Ok(())
}

async fn run_publish(
    cfg: &mut AppConfig,
    names: Vec<String>,
    params: Vec<(String, String)>,
    no_proxy: bool,
) -> anyhow::Result<()> {
    cfg.filter_publishers(&names);
    if cfg.publishers.is_empty() {
        warn!("没有匹配的发布器");
        return Ok(());
    }

    let store = ProxyStore::connect(&cfg.database.path).await?;

    let mut manager = system_proxy_manager(cfg, &store, no_proxy);
    let active_proxy = match &mut manager {
        Some(m) => m.get_proxy().await,
        None => None,
    };

    let registry = PublisherRegistry::builtin();
    for pub_cfg in &mut cfg.publishers {
        info!("📨 运行发布器 {}（{}）...", pub_cfg.name, pub_cfg.kind);

        let publisher = match registry.get(&pub_cfg.kind) {
            Ok(p) => p,
            Err(e) => {
                warn!("跳过：{}", e);
                continue;
            }
        };

        pub_cfg.params.insert(
            "_timeout".to_string(),
            serde_json::json!(cfg.tester.speed_timeout),
        );
        override_params(&mut pub_cfg.params, &params);
        if let Some(addr) = &active_proxy {
            pub_cfg
                .params
                .insert("_proxy_url".to_string(), serde_json::json!(addr));
        }

        let categories = store.load_categories(&pub_cfg.categories).await?;
        match publisher.publish(&categories, &pub_cfg.params).await {
            Ok(()) => info!("✅ 发布成功"),
            Err(e) => error!("发布失败：{}", e),
        }
    }

    if let Some(mut m) = manager {
        m.stop().await;
    }
    Ok(())
}

fn system_proxy_manager(
    cfg: &AppConfig,
    store: &ProxyStore,
    no_proxy: bool,
) -> Option<BootstrapManager> {
    if !cfg.system_proxy.enabled || no_proxy {
        return None;
    }
    info!("🛡️  初始化自举代理...");
    Some(BootstrapManager::new(
        store.clone(),
        cfg.tester.clone(),
        cfg.system_proxy.category.clone(),
        cfg.system_proxy.fallback.clone(),
    ))
}

async fn run_status(cfg: &AppConfig) -> anyhow::Result<()> {
    let store = ProxyStore::connect(&cfg.database.path).await?;

    let total = store.count_proxies().await?;
    let cat_counts = store.category_counts().await?;
    let countries = store.top_countries(5).await?;

    // 协议统计直接在内存里数前缀，省得拼一堆 SQL LIKE
    let mut proto_counts: HashMap<String, u32> = HashMap::new();
    for raw in store.raw_links().await? {
        let proto = raw.split("://").next().unwrap_or("").to_string();
        *proto_counts.entry(proto).or_insert(0) += 1;
    }

    println!("\n📊 PROXYFORGE 状态面板");
    println!("────────────────────────────────────────");

    println!("[ 系统 ]");
    println!("  数据库:      {}", cfg.database.path);
    if let Ok(meta) = std::fs::metadata(&cfg.database.path) {
        println!("  占用空间:    {}", format_bytes(meta.len()));
    }
    println!("  代理总数:    {}", total);
    println!();

    println!("[ 分类 ]");
    if cat_counts.is_empty() {
        println!("  （还没有分类数据）");
    } else {
        for (name, count) in cat_counts {
            println!("  {}: {}", name, count);
        }
    }
    println!();

    println!("[ 协议 ]");
    let mut protos: Vec<_> = proto_counts.into_iter().collect();
    protos.sort();
    for (proto, count) in protos {
        println!("  {}: {}", proto, count);
    }
    println!();

    println!("[ 出口国家 Top 5 ]");
    for (country, count) in countries {
        println!("  {} {}: {}", flag_emoji(&country), country, count);
    }
    println!();

    Ok(())
}

async fn run_prune(cfg: &AppConfig, limit: u32) -> anyhow::Result<()> {
    let store = ProxyStore::connect(&cfg.database.path).await?;
    let registry = StrategyRegistry::builtin();

    // 打分要知道观测网络；探测失败就按 unknown 保守排序
    let env_isp = match GeoIp::open(&cfg.tester.geoip_asn_path, &cfg.tester.geoip_country_path) {
        Ok(geoip) => environment::detect(&cfg.tester, &geoip).await.isp,
        Err(e) => {
            warn!("GeoIP 打开失败（{}），按 unknown 排序", e);
            "unknown".to_string()
        }
    };

    let deleted = prune_database(&store, cfg, &registry, &env_isp, limit).await?;
    if deleted == 0 {
        info!("数据库未超限，无需清理");
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}B",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}
