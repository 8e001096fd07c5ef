//! The run controller: owns the step loop, enforces the step budget and
//! wall-clock deadline, and guarantees the browser session is released on
//! every exit path before the result is assembled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineKind;
use crate::extract;
use crate::model::{AgentAction, ModelBackend};
use crate::record::{Finalizer, VideoArtifact};
use crate::session::{Provisioner, Vehicle};
use crate::{Error, Result};

/// A run escalates to `Failed` when this many actions in a row fail to
/// apply. Single failures are recorded and shown to the model instead.
const MAX_CONSECUTIVE_ACTION_FAILURES: u32 = 3;

/// Terminal states absorb: once a run leaves `Running` it never re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    StepExhausted,
    TimedOut,
    Failed,
}

/// How one step's action landed.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub ok: bool,
    pub detail: String,
    /// Set when the model declared the task complete on this step.
    pub done: bool,
}

/// One observe-decide-act cycle. Append-only once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub index: u32,
    pub observed: String,
    pub action: String,
    pub outcome: StepOutcome,
}

/// Everything a run needs besides its resolved backend.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: String,
    /// Task prompt, already wrapped with the agent ground rules.
    pub task: String,
    pub max_steps: u32,
    pub max_duration: Duration,
    pub engine: EngineKind,
}

/// The finished run, ready for assembly into a response.
#[derive(Debug, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub steps: Vec<Step>,
    /// Structured data recovered from the final `done` summary.
    pub result: Option<serde_json::Value>,
    /// Present only when `status` is `Failed`.
    pub error: Option<String>,
    pub video: Option<VideoArtifact>,
    pub duration_ms: u64,
}

/// Drives runs from provisioning to a finalized artifact.
pub struct Controller {
    provisioner: Arc<dyn Provisioner>,
    finalizer: Arc<dyn Finalizer>,
}

impl Controller {
    pub fn new(provisioner: Arc<dyn Provisioner>, finalizer: Arc<dyn Finalizer>) -> Self {
        Self {
            provisioner,
            finalizer,
        }
    }

    /// Execute one run to a terminal state. Never panics, never leaks the
    /// session: every return path below the acquire releases the vehicle
    /// before finalizing the recording.
    pub async fn execute(&self, spec: RunSpec, backend: Arc<dyn ModelBackend>) -> RunRecord {
        let started = Instant::now();
        let deadline = started + spec.max_duration;

        info!(
            "run {}: model={} max_steps={} budget={}s task={:?}",
            spec.run_id,
            backend.id(),
            spec.max_steps,
            spec.max_duration.as_secs(),
            truncated(&spec.task, 120),
        );

        let mut record = RunRecord {
            run_id: spec.run_id.clone(),
            model: backend.id().to_string(),
            started_at: Utc::now(),
            status: RunStatus::Running,
            steps: Vec::new(),
            result: None,
            error: None,
            video: None,
            duration_ms: 0,
        };

        let mut vehicle = match self.provisioner.acquire(&spec.run_id, spec.engine).await {
            Ok(vehicle) => vehicle,
            Err(e) => {
                warn!("run {}: provisioning failed: {}", spec.run_id, e);
                record.status = RunStatus::Failed;
                record.error = Some(e.to_string());
                record.duration_ms = started.elapsed().as_millis() as u64;
                return record;
            }
        };

        let mut consecutive_failures = 0u32;

        loop {
            if record.steps.len() as u32 >= spec.max_steps {
                record.status = RunStatus::StepExhausted;
                break;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                record.status = RunStatus::TimedOut;
                break;
            };

            let index = record.steps.len() as u32;
            let step = tokio::time::timeout(
                remaining,
                execute_step(
                    vehicle.as_mut(),
                    backend.as_ref(),
                    &spec.task,
                    &record.steps,
                    index,
                ),
            )
            .await;

            match step {
                // deadline fired mid-step: the in-flight model call or
                // browser action is dropped, not retried
                Err(_) => {
                    info!(
                        "run {}: {} (step {} in flight)",
                        spec.run_id,
                        Error::Timeout(spec.max_duration.as_secs()),
                        index
                    );
                    record.status = RunStatus::TimedOut;
                    break;
                }
                Ok(Err(e)) => {
                    warn!("run {}: fatal error at step {}: {}", spec.run_id, index, e);
                    record.status = RunStatus::Failed;
                    record.error = Some(e.to_string());
                    break;
                }
                Ok(Ok(step)) => {
                    let done = step.outcome.done;
                    let ok = step.outcome.ok;
                    if done {
                        record.result = Some(extract::clean_result(&step.outcome.detail));
                    }
                    record.steps.push(step);

                    if done {
                        record.status = RunStatus::Succeeded;
                        break;
                    }
                    if ok {
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_CONSECUTIVE_ACTION_FAILURES {
                            record.status = RunStatus::Failed;
                            record.error = Some(format!(
                                "{} consecutive actions failed to apply",
                                consecutive_failures
                            ));
                            break;
                        }
                    }
                }
            }
        }

        // release the session on every terminal path, then finalize
        let sink = vehicle.close().await;
        match self.finalizer.finalize(sink).await {
            Ok(artifact) => record.video = Some(artifact),
            // degraded artifact only — the run status stands
            Err(e) => warn!("run {}: video finalization failed: {}", spec.run_id, e),
        }

        record.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "run {}: {:?} after {} step(s) in {}ms",
            spec.run_id,
            record.status,
            record.steps.len(),
            record.duration_ms
        );
        record
    }
}

/// One observe-decide-act turn. Backend failures get one immediate retry;
/// a second failure is fatal for the run. Action-apply failures are
/// recorded in the outcome and left to the controller's policy.
async fn execute_step(
    vehicle: &mut dyn Vehicle,
    backend: &dyn ModelBackend,
    task: &str,
    history: &[Step],
    index: u32,
) -> Result<Step> {
    let view = vehicle.view().await?;
    let observed = view.summary();

    let action = match backend.next_action(task, history, &view).await {
        Ok(action) => action,
        Err(e) => {
            warn!("backend call failed, retrying once: {}", e);
            backend.next_action(task, history, &view).await?
        }
    };
    debug!("step {}: {}", index, action.describe());

    if let AgentAction::Done { summary } = &action {
        return Ok(Step {
            index,
            observed,
            action: action.describe(),
            outcome: StepOutcome {
                ok: true,
                detail: summary.clone(),
                done: true,
            },
        });
    }

    let outcome = match vehicle.apply(&action).await {
        Ok(detail) => StepOutcome {
            ok: true,
            detail,
            done: false,
        },
        Err(Error::Action(detail)) => StepOutcome {
            ok: false,
            detail,
            done: false,
        },
        Err(e) => return Err(e),
    };

    Ok(Step {
        index,
        observed,
        action: action.describe(),
        outcome,
    })
}

fn truncated(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max);
        format!("{}...", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::StepExhausted).unwrap(),
            "step_exhausted"
        );
        assert_eq!(serde_json::to_value(RunStatus::TimedOut).unwrap(), "timed_out");
        assert_eq!(serde_json::to_value(RunStatus::Succeeded).unwrap(), "succeeded");
    }

    #[test]
    fn test_truncated_respects_char_boundaries() {
        assert_eq!(truncated("short", 120), "short");
        let long = "é".repeat(100);
        let cut = truncated(&long, 21);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 25);
    }
}
