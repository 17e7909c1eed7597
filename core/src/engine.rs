//! Dependency engine: the top-level supervision lifecycle.
//!
//! The engine wires the graveyard watcher and the pod-readiness watcher
//! to one [`Supervisor`]: death dependencies trigger a graceful shutdown
//! of the child, birth dependencies gate its start, and the child's own
//! birth and death are published to the graveyard for peers. The engine
//! computes the process exit code; callers hand it straight to
//! `std::process::exit`.

use crate::error::{CoreError, Result};
use crate::event::{self, Trace};
use crate::kubernetes::{self, PodEventHandler};
use crate::shutdown::{Shutdown, ShutdownGuard};
use crate::supervisor::Supervisor;
use crate::tombstone::{self, EventHandler, Tombstone};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// How long the fatal path waits for the child to be reaped after `KILL`
/// before giving up on it.
const REAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved engine configuration. Parsed by the binary, consumed here.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub name: String,
    pub graveyard: PathBuf,
    pub birth_deps: Vec<String>,
    pub death_deps: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub birth_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub verbose_level: u32,
    pub instant_logging: bool,
}

impl Config {
    fn validate(&self) -> Result<()> {
        if !self.birth_deps.is_empty() {
            if self.pod_name.as_deref().unwrap_or("").is_empty() {
                return Err(CoreError::Configuration(
                    "birth deps configured without a pod name".to_string(),
                ));
            }
            if self.namespace.as_deref().unwrap_or("").is_empty() {
                return Err(CoreError::Configuration(
                    "birth deps configured without a namespace".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Supervise `argv` under `config` and return the process exit code.
pub async fn run(config: Config, argv: Vec<String>) -> i32 {
    Engine::new(config).run(argv).await
}

/// Outcome of the birth-wait stage.
enum BirthWait {
    /// All birth deps reported ready (or the pod watch ended on its own).
    Ready,
    /// `TERM` arrived while waiting; exit cleanly without starting.
    Interrupted,
}

struct Engine {
    config: Config,
    traces: Vec<Trace>,
}

impl Engine {
    fn new(config: Config) -> Self {
        Self {
            config,
            traces: Vec::new(),
        }
    }

    /// Create a trace, register it for the final bundle, and return a
    /// handle for the component that owns it.
    fn trace(&mut self, id: impl Into<String>) -> Trace {
        let trace = if self.config.instant_logging {
            Trace::instant(id)
        } else {
            Trace::new(id)
        };
        self.traces.push(trace.clone());
        trace
    }

    async fn run(&mut self, argv: Vec<String>) -> i32 {
        if argv.is_empty() {
            error!("no arguments found");
            return 2;
        }
        if let Err(err) = self.config.validate() {
            self.emit_error(&err);
            return 1;
        }

        let tombstone_trace = self.trace(format!("{} tombstone", self.config.name));
        let tombstone = Tombstone::new(
            self.config.graveyard.clone(),
            self.config.name.clone(),
            tombstone_trace,
        );

        let supervisor_trace = self.trace("supervisor");
        let child = Arc::new(Supervisor::new(
            argv[0].clone(),
            &argv[1..],
            supervisor_trace,
        ));

        // Watch for death deps before waiting on birth deps, so a peer's
        // early death can interrupt the wait.
        let _graveyard_watch: Option<ShutdownGuard> = if self.config.death_deps.is_empty() {
            None
        } else {
            let watch_shutdown = Shutdown::new();
            let trace = self.trace("death graveyard watcher");
            let handler = Arc::new(OnDeathOfAny::new(
                &self.config.death_deps,
                Arc::clone(&child),
                self.config.grace_period,
                watch_shutdown.clone(),
            ));
            if let Err(err) = tombstone::watch(
                &self.config.graveyard,
                handler,
                watch_shutdown.clone(),
                trace,
            ) {
                return self
                    .fatal(&child, &tombstone, err.context("failed to watch graveyard"))
                    .await;
            }
            // stop the graveyard watcher on exit, if not sooner
            Some(watch_shutdown.guard())
        };

        if !self.config.birth_deps.is_empty() {
            let trace = self.trace("birth dependencies watcher");
            match self.wait_for_birth_deps(trace).await {
                Ok(BirthWait::Ready) => {}
                Ok(BirthWait::Interrupted) => {
                    info!("received TERM while waiting for birth deps, exiting without child");
                    return 0;
                }
                Err(err) => return self.fatal(&child, &tombstone, err).await,
            }
        }

        if let Err(err) = child.start() {
            return self.fatal(&child, &tombstone, err).await;
        }
        if let Err(err) = tombstone.record_birth().await {
            return self.fatal(&child, &tombstone, err).await;
        }

        let code = exit_code(child.wait().await);

        if let Err(err) = tombstone.record_death(code).await {
            // peers care about the record, but the child's own exit code
            // stays authoritative
            error!(error = %err, "failed to record death");
        }

        if self.config.verbose_level > 0 {
            self.emit_success();
        }
        code
    }

    /// Block until every birth dep is ready, `TERM` arrives, or the
    /// birth timeout elapses.
    async fn wait_for_birth_deps(&self, trace: Trace) -> Result<BirthWait> {
        let namespace = self.config.namespace.clone().unwrap_or_default();
        let pod_name = self.config.pod_name.clone().unwrap_or_default();

        let wait = Shutdown::new();
        // stop the pod watcher and the TERM listener on exit, if not sooner
        let _stop = wait.guard();

        let term_seen = Arc::new(AtomicBool::new(false));
        let mut term = signal(SignalKind::terminate())?;
        {
            let wait = wait.clone();
            let term_seen = Arc::clone(&term_seen);
            tokio::spawn(async move {
                tokio::select! {
                    _ = wait.cancelled() => {}
                    _ = term.recv() => {
                        term_seen.store(true, Ordering::SeqCst);
                        wait.cancel();
                    }
                }
            });
        }

        let handler = Arc::new(OnReadyOfAll::new(&self.config.birth_deps, wait.clone()));
        trace.add_event(format!("Watching pod {pod_name} updates"));
        kubernetes::watch_pod(&namespace, &pod_name, handler, wait.clone(), trace.clone())
            .await
            .map_err(|err| err.context("failed to watch pod"))?;

        tokio::select! {
            _ = wait.cancelled() => {
                if term_seen.load(Ordering::SeqCst) {
                    return Ok(BirthWait::Interrupted);
                }
                trace.add_event(format!(
                    "All birth deps ready: {}",
                    self.config.birth_deps.join(", ")
                ));
                Ok(BirthWait::Ready)
            }
            _ = tokio::time::sleep(self.config.birth_timeout) => {
                Err(CoreError::BirthTimeout(self.config.birth_timeout))
            }
        }
    }

    /// Terminal-error path. The child may or may not be running: if it
    /// was started it is force-stopped and reaped, and its death is
    /// recorded for waiting peers. Cleanup failures are composed into
    /// the original error; the exit code is always `1`.
    async fn fatal(&self, child: &Arc<Supervisor>, tombstone: &Tombstone, err: CoreError) -> i32 {
        const EXIT_CODE: i32 = 1;
        let mut err = err;

        if child.was_started() {
            if let Err(stop) = child.shutdown_force() {
                self.emit_error(&err.compose(stop));
                return EXIT_CODE;
            }
            // KILL was already delivered, so the bounded reap only
            // guards against an unkillable child
            let code = match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(result) => exit_code(result),
                Err(_elapsed) => {
                    err = err.compose(CoreError::ReapTimeout(REAP_TIMEOUT));
                    -1
                }
            };
            if let Err(death) = tombstone.record_death(code).await {
                err = err.compose(death);
            }
        }

        self.emit_error(&err);
        EXIT_CODE
    }

    fn emit_success(&self) {
        match event::fire_all(&self.traces) {
            Ok(bundle) => {
                info!(event_traces = %json_bundle(&bundle), "supervising proceed successfully");
            }
            Err(err) => error!(error = %err, "failed to serialize event traces"),
        }
    }

    fn emit_error(&self, err: &CoreError) {
        match event::fire_all(&self.traces) {
            Ok(bundle) => {
                error!(event_traces = %json_bundle(&bundle), error = %err, "supervising failed");
            }
            Err(fire) => {
                error!(serialize_error = %fire, error = %err, "supervising failed");
            }
        }
    }
}

fn json_bundle(bundle: &[serde_json::Value]) -> String {
    serde_json::to_string(bundle).unwrap_or_else(|_| "[]".to_string())
}

/// Map the child's wait result to a process exit code: a clean status
/// yields its code, an abnormal exit (signal) or wait failure yields -1.
fn exit_code(result: Result<ExitStatus>) -> i32 {
    match result {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

/// Graveyard handler that gracefully shuts the child down the first time
/// any death dep's tombstone reports death.
struct OnDeathOfAny {
    death_deps: HashSet<String>,
    child: Arc<Supervisor>,
    grace_period: Duration,
    watch_shutdown: Shutdown,
    fired: AtomicBool,
}

impl OnDeathOfAny {
    fn new(
        death_deps: &[String],
        child: Arc<Supervisor>,
        grace_period: Duration,
        watch_shutdown: Shutdown,
    ) -> Self {
        Self {
            death_deps: death_deps.iter().cloned().collect(),
            child,
            grace_period,
            watch_shutdown,
            fired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventHandler for OnDeathOfAny {
    async fn handle(&self, trace: &Trace, event: &notify::Event) -> Result<()> {
        for path in &event.paths {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(graveyard) = path.parent() else {
                continue;
            };
            if !self.death_deps.contains(name) {
                trace.add_event(format!("Ignore tombstone {name}"));
                continue;
            }

            // events coalesce, so re-read the file on every hint
            trace.add_event(format!("Reading tombstone: {name}"));
            let observed = tombstone::read(graveyard, name)
                .await
                .map_err(|err| err.context(format!("failed to read tombstone {name}")))?;
            if observed.died().is_none() {
                // still alive
                continue;
            }
            trace.add_event(format!("New death: {name}"));

            if self.fired.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.watch_shutdown.cancel();
            // returns immediately; the grace timer escalates to KILL.
            // Skipped if the child has not started.
            self.child
                .shutdown_graceful(self.grace_period)
                .map_err(|err| err.context("failed to shutdown"))?;
        }
        Ok(())
    }
}

/// Pod handler that fires a one-shot ready signal once every birth dep's
/// container reports ready.
struct OnReadyOfAll {
    birth_deps: Vec<String>,
    ready: Shutdown,
}

impl OnReadyOfAll {
    fn new(birth_deps: &[String], ready: Shutdown) -> Self {
        Self {
            birth_deps: birth_deps.to_vec(),
            ready,
        }
    }
}

#[async_trait]
impl PodEventHandler for OnReadyOfAll {
    async fn handle(&self, trace: &Trace, event: &WatchEvent<Pod>) {
        let pod = match event {
            // the watcher terminates itself on delete
            WatchEvent::Deleted(_) => return,
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => pod,
            other => {
                trace.add_event(format!("Error: unexpected non-pod event: {other:?}"));
                return;
            }
        };

        let ready = kubernetes::ready_containers(pod);
        if self
            .birth_deps
            .iter()
            .all(|dep| ready.contains(dep.as_str()))
        {
            self.ready.cancel();
        }
    }
}
