//! 批量模拟
//!
//! 按顺序轮换查询列表，逐个运行会话，两次运行之间休眠，
//! 结束后按结局汇总。Ctrl+C（cancel_all）会中断当前会话并停止后续运行。

use std::time::Duration;

use serde::Serialize;

use crate::analysis::{classify, OutcomeClass};
use crate::core::{AgentError, AgentRuntime, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct SimulationRun {
    pub index: usize,
    pub query: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub steps: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationSummary {
    pub runs: Vec<SimulationRun>,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    /// 被取消，未跑完全部轮次
    pub interrupted: bool,
}

impl SimulationSummary {
    fn push(&mut self, run: SimulationRun) {
        match classify(run.status) {
            OutcomeClass::Success => self.success += 1,
            OutcomeClass::Partial => self.partial += 1,
            OutcomeClass::Failed | OutcomeClass::Unknown => self.failed += 1,
        }
        self.runs.push(run);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for run in &self.runs {
            out.push_str(&format!(
                "#{:<3} {:<10} steps={:<2} {}  {}\n",
                run.index, run.status, run.steps, run.session_id, run.query
            ));
        }
        out.push_str(&format!(
            "runs: {}  success: {}  partial: {}  failed: {}\n",
            self.runs.len(),
            self.success,
            self.partial,
            self.failed
        ));
        if self.interrupted {
            out.push_str("interrupted before all runs finished\n");
        }
        out
    }
}

/// 秒数转间隔；负数或非法值按 0 处理
pub fn sleep_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or_default()
}

pub async fn simulate(
    runtime: &AgentRuntime,
    queries: &[String],
    runs: usize,
    sleep: Duration,
) -> Result<SimulationSummary, AgentError> {
    if queries.is_empty() {
        return Err(AgentError::Config("simulation needs at least one query".to_string()));
    }
    let shutdown = runtime.supervisor().shutdown_token();
    let mut summary = SimulationSummary::default();

    for index in 0..runs {
        if shutdown.is_cancelled() {
            summary.interrupted = true;
            break;
        }
        let query = &queries[index % queries.len()];
        tracing::info!(run = index + 1, total = runs, %query, "Simulation run");
        let report = runtime.start(query).await;
        summary.push(SimulationRun {
            index: index + 1,
            query: query.clone(),
            session_id: report.record.session_id.clone(),
            status: report.status(),
            steps: report.record.step_count,
        });

        if index + 1 < runs && !sleep.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.cancelled() => {}
            }
        }
    }
    tracing::info!(
        runs = summary.runs.len(),
        success = summary.success,
        partial = summary.partial,
        failed = summary.failed,
        "Simulation finished"
    );
    Ok(summary)
}
