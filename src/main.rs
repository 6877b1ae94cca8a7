//! Hive 命令行
//!
//! run / resume / replay / analyze / simulate；Ctrl+C 取消正在运行的会话（在下一步开始前生效）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use hive::analysis::analyze_store;
use hive::config::{load_config, AppConfig};
use hive::simulation::{simulate, sleep_from_secs};
use hive::{AgentRuntime, LoopOutcome, RunReport};

#[derive(Parser)]
#[command(name = "hive", version, about = "Perception / decision / sandbox / evaluation agent loop")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 运行一个新会话
    Run {
        query: String,
        /// 输出完整会话记录 JSON
        #[arg(long)]
        json: bool,
    },
    /// 带人工输入恢复已升级的会话
    Resume {
        session_id: String,
        #[arg(long)]
        token: String,
        input: String,
        #[arg(long)]
        json: bool,
    },
    /// 用记录的响应回放会话，比较轨迹阶段
    Replay { session_id: String },
    /// 汇总已持久化的会话与工具性能日志
    Analyze {
        #[arg(long)]
        json: bool,
    },
    /// 按 [simulation] 查询列表批量运行
    Simulate {
        /// 运行次数，默认取 [simulation].runs
        #[arg(long, env = "SIM_TESTS")]
        runs: Option<usize>,
        #[arg(long, env = "SIM_SLEEP_SECONDS")]
        sleep_secs: Option<f64>,
        #[arg(long)]
        json: bool,
    },
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.record)?);
        return Ok(());
    }
    let record = &report.record;
    println!("session: {}", record.session_id);
    println!("status:  {}", record.final_status);
    println!("steps:   {}  retries: {}", record.step_count, record.retry_count);
    if !record.plans.is_empty() {
        println!("{}", record.plans.render());
    }
    match &report.outcome {
        LoopOutcome::Concluded { answer } => println!("answer:  {answer}"),
        LoopOutcome::Escalated(request) => {
            println!("needs input: {}", request.question);
            if let Some(critique) = &request.critique {
                println!("critic: {}", critique.advice);
            }
            println!(
                "resume with: hive resume {} --token {} \"<your input>\"",
                request.session_id, request.resume_token
            );
        }
        LoopOutcome::Failed { reason } => println!("failed:  {reason}"),
    }
    Ok(())
}

/// Ctrl+C 时取消全部会话
fn spawn_ctrl_c(runtime: Arc<AgentRuntime>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling before the next step");
            runtime.cancel_all();
        }
    });
}

fn log_usage(runtime: &AgentRuntime) {
    let (prompt, completion, total) = runtime.token_usage();
    tracing::info!(prompt, completion, total, "Token usage");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    match cli.command {
        Command::Run { query, json } => {
            let runtime = Arc::new(AgentRuntime::from_config(cfg));
            spawn_ctrl_c(runtime.clone());
            let report = runtime.start(&query).await;
            print_report(&report, json)?;
            log_usage(&runtime);
        }
        Command::Resume {
            session_id,
            token,
            input,
            json,
        } => {
            let runtime = Arc::new(AgentRuntime::from_config(cfg));
            spawn_ctrl_c(runtime.clone());
            let report = runtime
                .resume(&session_id, &token, &input)
                .await
                .with_context(|| format!("Failed to resume session {session_id}"))?;
            print_report(&report, json)?;
            log_usage(&runtime);
        }
        Command::Replay { session_id } => {
            let runtime = AgentRuntime::from_config(cfg);
            let report = runtime
                .replay(&session_id)
                .await
                .with_context(|| format!("Failed to replay session {session_id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(at) = report.first_divergence() {
                anyhow::bail!("replay diverged at stage {at}");
            }
        }
        Command::Analyze { json } => {
            let runtime = AgentRuntime::from_config(cfg);
            let analysis = analyze_store(
                runtime.sessions().as_ref(),
                runtime.perf_log().as_ref(),
                runtime.config().storage.summary_window,
            )
            .context("Failed to analyze sessions")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                print!("{}", analysis.render());
            }
        }
        Command::Simulate { runs, sleep_secs, json } => {
            let queries = cfg.simulation.queries.clone();
            let runs = runs.unwrap_or(cfg.simulation.runs);
            let sleep = sleep_from_secs(sleep_secs.unwrap_or(cfg.simulation.sleep_secs));
            let runtime = Arc::new(AgentRuntime::from_config(cfg));
            spawn_ctrl_c(runtime.clone());
            let summary = simulate(&runtime, &queries, runs, sleep)
                .await
                .context("Simulation failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render());
            }
            log_usage(&runtime);
        }
    }
    Ok(())
}
