//! distlog - replicated append-only commit log node

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use distlog::agent::{Agent, AgentConfig, MembershipHandler, ReplicationMode};
use distlog::config::{RaftConfig, SegmentConfig};

/// 节点配置
#[derive(Parser, Debug)]
#[command(name = "distlog")]
#[command(about = "Replicated append-only commit log")]
struct Args {
    /// 数据存储目录
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// RPC 监听地址
    #[arg(long, default_value = "127.0.0.1:8400")]
    bind_addr: String,

    /// 节点名称，集群内唯一
    #[arg(long, default_value = "node1")]
    node_name: String,

    /// 无本地状态时以单节点集群启动
    #[arg(long)]
    bootstrap: bool,

    /// 其他成员，格式 name=addr
    #[arg(long = "join", value_parser = parse_member)]
    join: Vec<(String, String)>,

    #[arg(long, value_enum, default_value_t = ReplicationMode::Consensus)]
    mode: ReplicationMode,

    #[arg(long, requires = "acl_policy_file")]
    acl_model_file: Option<PathBuf>,

    #[arg(long, requires = "acl_model_file")]
    acl_policy_file: Option<PathBuf>,

    /// 访问其他节点时使用的身份
    #[arg(long, default_value = "root")]
    subject: String,

    /// 日志级别，RUST_LOG 优先
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_member(s: &str) -> anyhow::Result<(String, String)> {
    match s.split_once('=') {
        Some((name, addr)) if !name.is_empty() && !addr.is_empty() => {
            Ok((name.to_string(), addr.to_string()))
        }
        _ => bail!("expected name=addr, got {:?}", s),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting distlog node {} on {}", args.node_name, args.bind_addr);
    info!("Data directory: {:?}", args.data_dir);

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create {:?}", args.data_dir))?;

    let config = AgentConfig {
        data_dir: args.data_dir,
        bind_addr: args.bind_addr,
        node_name: args.node_name.clone(),
        bootstrap: args.bootstrap,
        start_join_addrs: args.join.iter().map(|(_, addr)| addr.clone()).collect(),
        mode: args.mode,
        acl_model_file: args.acl_model_file,
        acl_policy_file: args.acl_policy_file,
        subject: args.subject,
        segment: SegmentConfig::default(),
        raft: RaftConfig::with_local_id(args.node_name),
        ..Default::default()
    };
    let agent = Agent::new(config).await?;
    info!("Listening on {}", agent.rpc_addr());

    if !args.join.is_empty() {
        // 只有 leader 能变更成员
        if args.mode == ReplicationMode::Consensus {
            if let Err(e) = agent.wait_for_leader(Duration::from_secs(10)).await {
                warn!("No leader yet: {}", e);
            }
        }
        for (name, addr) in &args.join {
            if let Err(e) = agent.join(name, addr).await {
                warn!("Failed to add {} at {}: {}", name, addr, e);
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    agent.shutdown().await
}
