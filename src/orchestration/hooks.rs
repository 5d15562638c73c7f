//! Extension points.
//!
//! Lifecycle observers see every event after it is persisted, gate
//! extensions add checks to a level's gating phase, and a launcher can
//! replace the built-in executor. A misbehaving hook (error or panic) is
//! logged and contained; it never changes the run's outcome.

use crate::error::Result;
use crate::orchestration::executor::TaskExecutor;
use crate::state::{Event, EventKind, GateCheck, RunState};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Receives lifecycle events.
pub trait LifecycleObserver: Send + Sync {
    fn name(&self) -> &str;

    /// Filter on event kind. Defaults to every event.
    fn interested(&self, _kind: EventKind) -> bool {
        true
    }

    /// `state` is a snapshot taken after the event was persisted.
    fn on_event(&self, event: &Event, state: &RunState) -> Result<()>;
}

/// Verdict of a gate extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub passed: bool,
    pub output: String,
}

impl GateOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// An additional check run during a level's gating phase.
#[async_trait]
pub trait GateExtension: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failure blocks the level.
    fn required(&self) -> bool {
        true
    }

    /// `workdir` holds the level's integrated output.
    async fn check(&self, level: u32, workdir: &Path) -> Result<GateOutcome>;
}

/// Registered hooks for a run.
#[derive(Default, Clone)]
pub struct HookRegistry {
    observers: Vec<Arc<dyn LifecycleObserver>>,
    gates: Vec<Arc<dyn GateExtension>>,
    launcher: Option<Arc<dyn TaskExecutor>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field(
                "observers",
                &self.observers.iter().map(|o| o.name()).collect::<Vec<_>>(),
            )
            .field(
                "gates",
                &self.gates.iter().map(|g| g.name()).collect::<Vec<_>>(),
            )
            .field("launcher", &self.launcher.as_ref().map(|l| l.name()))
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn LifecycleObserver>) {
        debug!(observer = observer.name(), "observer registered");
        self.observers.push(observer);
    }

    pub fn add_gate(&mut self, gate: Arc<dyn GateExtension>) {
        debug!(gate = gate.name(), "gate extension registered");
        self.gates.push(gate);
    }

    /// Replace the built-in launcher.
    pub fn set_launcher(&mut self, launcher: Arc<dyn TaskExecutor>) {
        debug!(launcher = launcher.name(), "launcher registered");
        self.launcher = Some(launcher);
    }

    pub fn launcher(&self) -> Option<Arc<dyn TaskExecutor>> {
        self.launcher.clone()
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Deliver `event` to every interested observer. Returns how many
    /// observers failed.
    pub fn emit(&self, event: &Event, state: &RunState) -> usize {
        let mut failures = 0;
        for observer in self
            .observers
            .iter()
            .filter(|o| o.interested(event.kind))
        {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event, state)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(observer = observer.name(), event = %event.kind, error = %e, "observer failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(observer = observer.name(), event = %event.kind, "observer panicked");
                }
            }
        }
        failures
    }

    /// Run every gate extension against `workdir`. Errors and panics count
    /// as a failed check.
    pub async fn run_gates(&self, level: u32, workdir: &Path) -> Vec<GateCheck> {
        let mut checks = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(gate.check(level, workdir))
                .catch_unwind()
                .await;
            let (passed, output) = match outcome {
                Ok(Ok(verdict)) => (verdict.passed, verdict.output),
                Ok(Err(e)) => (false, format!("gate error: {}", e)),
                Err(_) => (false, "gate panicked".to_string()),
            };
            if !passed {
                warn!(gate = gate.name(), level, "gate extension failed");
            }
            checks.push(GateCheck {
                name: gate.name().to_string(),
                command: String::new(),
                required: gate.required(),
                passed,
                exit_code: None,
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
                output,
            });
        }
        checks
    }
}
