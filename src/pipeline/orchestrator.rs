use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use super::state::{RunMachine, RunState, StageLifecycle, StageState};
use super::{RunContext, Stage, StageKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed { stage: StageKind, elapsed_secs: f64 },
    Skipped { stage: StageKind, reason: String },
    Failed { stage: StageKind, error: String },
}

impl StageOutcome {
    pub fn stage(&self) -> StageKind {
        match self {
            StageOutcome::Completed { stage, .. }
            | StageOutcome::Skipped { stage, .. }
            | StageOutcome::Failed { stage, .. } => *stage,
        }
    }
}

/// What happened during one run, written next to the output as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub device: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<StageOutcome>,
    pub cache_clears: usize,
    pub output: Option<PathBuf>,
}

impl RunReport {
    fn new(device: &DeviceContext) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            device: device.device().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
            cache_clears: 0,
            output: None,
        }
    }

    pub fn completed_stages(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, StageOutcome::Completed { .. }))
            .count()
    }

    /// Non-fatal stage failures of this run.
    pub fn skips(&self) -> Vec<DubError> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                StageOutcome::Skipped { stage, reason } => Some(DubError::NonFatalStageSkip {
                    stage: *stage,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// Runs stages strictly one after another. Each stage claims the device,
/// loads, runs and unloads; the device is then released and its cache
/// cleared once, whether the stage succeeded or not.
pub struct PipelineOrchestrator {
    stages: Vec<Box<dyn Stage>>,
    device: DeviceContext,
    machine: RunMachine,
    report: Option<RunReport>,
}

impl PipelineOrchestrator {
    pub fn new(device: DeviceContext) -> Self {
        Self {
            stages: Vec::new(),
            device,
            machine: RunMachine::new(),
            report: None,
        }
    }

    pub fn with_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    /// Report of the last run, also available after a failure.
    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    pub async fn run(&mut self, ctx: &mut RunContext) -> Result<RunReport> {
        if self.machine.state() != RunState::Idle {
            return Err(DubError::IllegalTransition {
                subject: "run".to_string(),
                from: self.machine.state().to_string(),
                to: "Idle".to_string(),
            });
        }
        if self.stages.is_empty() {
            return Err(DubError::Config("Pipeline has no stages".to_string()));
        }

        let mut report = RunReport::new(&self.device);
        info!(
            "Starting run {} on {}: {}",
            report.run_id,
            self.device.device(),
            self.stage_kinds()
                .iter()
                .map(|k| k.label())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        for stage in self.stages.iter_mut() {
            let kind = stage.kind();
            let started = Instant::now();

            let result = drive_stage(stage.as_mut(), ctx, &self.device, &mut self.machine).await;
            self.device.release(kind);
            self.device.clear_cache();

            match result {
                Ok(()) => {
                    let elapsed_secs = started.elapsed().as_secs_f64();
                    info!("Stage '{}' completed in {:.1}s", kind, elapsed_secs);
                    report.outcomes.push(StageOutcome::Completed { stage: kind, elapsed_secs });
                }
                Err(e) if !stage.is_fatal() && !matches!(e, DubError::IllegalTransition { .. }) => {
                    let skip = DubError::NonFatalStageSkip {
                        stage: kind,
                        reason: e.to_string(),
                    };
                    warn!("{}", skip);
                    report.outcomes.push(StageOutcome::Skipped {
                        stage: kind,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!("Stage '{}' failed: {}", kind, e);
                    report.outcomes.push(StageOutcome::Failed {
                        stage: kind,
                        error: e.to_string(),
                    });
                    self.machine.advance(RunState::Failed)?;
                    self.report = Some(finished(report, &self.device));
                    return Err(e.in_stage(kind));
                }
            }
        }

        self.machine.advance(RunState::Complete)?;
        report.output = Some(ctx.output.clone());
        let report = finished(report, &self.device);
        info!(
            "Run {} complete: {} stages, {} skipped",
            report.run_id,
            report.completed_stages(),
            report.skips().len()
        );
        self.report = Some(report.clone());
        Ok(report)
    }
}

fn finished(mut report: RunReport, device: &DeviceContext) -> RunReport {
    report.finished_at = Some(Utc::now());
    report.cache_clears = device.cache_clears();
    report
}

/// Claim, load, run and unload one stage. `unload` runs after any load or run failure.
async fn drive_stage(
    stage: &mut dyn Stage,
    ctx: &mut RunContext,
    device: &DeviceContext,
    machine: &mut RunMachine,
) -> Result<()> {
    let kind = stage.kind();
    let mut lifecycle = StageLifecycle::new(kind);

    device.claim(kind)?;
    info!("=== Stage '{}' ===", kind);

    if let Err(e) = stage.load(device).await {
        lifecycle.advance(StageState::Failed)?;
        if let Err(unload_err) = stage.unload().await {
            warn!("Unload after failed load of '{}' also failed: {}", kind, unload_err);
        }
        lifecycle.advance(StageState::Unloaded)?;
        machine.advance(RunState::StageUnloaded(kind))?;
        return Err(e);
    }
    lifecycle.advance(StageState::Loaded)?;
    machine.advance(RunState::StageLoaded(kind))?;

    lifecycle.advance(StageState::Running)?;
    machine.advance(RunState::StageRunning(kind))?;
    let ran = stage.run(ctx, device).await;
    lifecycle.advance(if ran.is_ok() {
        StageState::Executed
    } else {
        StageState::Failed
    })?;

    let unloaded = stage.unload().await;
    lifecycle.advance(StageState::Unloaded)?;
    machine.advance(RunState::StageUnloaded(kind))?;

    match (ran, unloaded) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(unload_err)) => {
            warn!("Unload after failed run of '{}' also failed: {}", kind, unload_err);
            Err(e)
        }
    }
}
