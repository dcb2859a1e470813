use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use fc_core::config::Config;
use fc_core::persistence::{InMemoryStore, Store};
use fc_core::types::{Channel, OrgRuntimeConfig, ProviderId, SessionState, VersionRecord};
use fc_fleet::{FleetManager, RunnerCommand};
use fc_harness::scheduler::{Job, Scheduler};
use fc_harness::shutdown::ShutdownSignal;
use fc_realtime::event_bus::InternalEvent;
use fc_realtime::hub::{RealtimeHub, StaticTokenVerifier};
use fc_session::SessionCoordinator;
use fc_telemetry::metrics::Metrics;
use fc_update::canary::CanaryManager;
use fc_update::registry::Registry;
use fc_update::rollout::RolloutController;
use fc_update::sources::{GithubReleasesSource, HomebrewSource, NpmSource};
use fc_update::sweep::SweepManager;
use fc_update::version_watcher::{VersionWatcher, WatchEvent};
use tokio::net::TcpListener;

use crate::rollout_metrics::SessionCoordinatorMetricsSource;

/// Shared handles every HTTP/WS handler reaches through. Constructed once by
/// [`Daemon::new`] and cloned (cheaply, all fields are `Arc`s) into the axum
/// router's state.
pub struct AppState {
    pub fleet: Arc<FleetManager>,
    pub sessions: Arc<SessionCoordinator>,
    pub registry: Arc<Registry>,
    pub rollouts: Arc<RolloutController>,
    pub sweeps: Arc<SweepManager>,
    pub canary: Arc<CanaryManager>,
    pub version_watcher: Arc<VersionWatcher>,
    pub hub: Arc<RealtimeHub>,
    pub orgs: Arc<InMemoryStore<String, OrgRuntimeConfig>>,
    pub metrics: Arc<Metrics>,
    pub start_time: std::time::Instant,
    pub config: Config,
}

/// Ties the four control-plane components together the way `at-daemon`'s
/// `Daemon` ties the agent supervisor, bead store, and API layer together:
/// one struct owning the shared state, a set of periodic background jobs,
/// and an HTTP/WS front door.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    state: Arc<AppState>,
    metrics_source: Arc<SessionCoordinatorMetricsSource>,
}

impl Daemon {
    pub async fn new(config: Config) -> Result<Self> {
        let fleet = Arc::new(FleetManager::new(config.fleet.clone()));
        let sessions = Arc::new(SessionCoordinator::new(config.session.clone(), fleet.clone()));
        let registry = Arc::new(Registry::new(config.update_pipeline.registry.clone()));
        let rollouts = Arc::new(RolloutController::new(config.update_pipeline.rollout.clone()));
        let sweeps = Arc::new(SweepManager::new(config.update_pipeline.sweep.clone()));
        let canary = Arc::new(CanaryManager::new());

        let mut watcher = VersionWatcher::new(config.update_pipeline.version_watcher.clone());
        watcher.add_source(ProviderId::Codex, Box::new(NpmSource::new("@openai/codex")));
        watcher.add_source(ProviderId::ClaudeCode, Box::new(NpmSource::new("@anthropic-ai/claude-code")));
        watcher.add_source(ProviderId::GeminiCli, Box::new(GithubReleasesSource::new("google-gemini", "gemini-cli")));
        watcher.add_source(ProviderId::Omnara, Box::new(HomebrewSource::new("omnara")));
        let version_watcher = Arc::new(watcher);

        let verifier = Arc::new(StaticTokenVerifier::new(HashMap::new()));
        let hub = Arc::new(RealtimeHub::new(config.realtime.clone(), verifier));
        let orgs = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(Metrics::new());

        spawn_terminal_input_forwarder(hub.event_bus(), sessions.clone(), fleet.clone());

        let state = Arc::new(AppState {
            fleet,
            sessions: sessions.clone(),
            registry,
            rollouts,
            sweeps,
            canary,
            version_watcher,
            hub,
            orgs,
            metrics,
            start_time: std::time::Instant::now(),
            config: config.clone(),
        });

        Ok(Self {
            config,
            shutdown: ShutdownSignal::new(),
            state,
            metrics_source: Arc::new(SessionCoordinatorMetricsSource::new(sessions)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Starts every background job (liveness sweeps, auto-rollout, registry
    /// deprecation, version polling, stale-connection reaping) behind the
    /// scheduler so shutdown tears them all down uniformly.
    fn spawn_background_jobs(&self) {
        let scheduler = Scheduler::new(self.shutdown.clone());

        {
            let state = self.state.clone();
            scheduler.spawn(
                Job { name: "fleet_liveness", interval: std::time::Duration::from_millis(self.config.fleet.health_check_interval_ms) },
                move || {
                    let state = state.clone();
                    async move {
                        let now = Utc::now();
                        let newly_offline = state.fleet.liveness_sweep(now).await;
                        let runners = state.fleet.list_runners().await;
                        let online = runners.iter().filter(|r| r.status == fc_core::types::RunnerStatus::Online).count();
                        state.metrics.set_gauge("online_runners", online as i64);
                        for runner_id in &newly_offline {
                            tracing::warn!(%runner_id, "runner marked offline");
                            state.metrics.incr("runners_marked_offline");
                            state.hub.broadcast_event("runner_offline", Some(serde_json::json!({ "runner_id": runner_id }))).await;
                        }
                        for (runner_id, session_ids) in state.fleet.runners_past_offline_grace(now).await {
                            for session_id in session_ids {
                                state.sessions.report_state(session_id, SessionState::Failed).await;
                                state
                                    .hub
                                    .broadcast_session_event(session_id, fc_realtime::protocol::SessionAction::StateChange, serde_json::json!({ "state": "FAILED", "reason": "runner offline" }))
                                    .await;
                            }
                            tracing::warn!(%runner_id, "runner past offline grace, sessions failed");
                        }
                    }
                },
            );
        }

        if self.config.update_pipeline.auto_rollout {
            let state = self.state.clone();
            let metrics_source = self.metrics_source.clone();
            scheduler.spawn(
                Job { name: "rollout_progress", interval: std::time::Duration::from_millis(self.config.update_pipeline.rollout.check_interval_ms) },
                move || {
                    let state = state.clone();
                    let metrics_source = metrics_source.clone();
                    async move {
                        let orgs = state.orgs.list().await;
                        state
                            .rollouts
                            .check_and_progress(Utc::now(), metrics_source.as_ref(), |channel| eligible_orgs(&orgs, channel))
                            .await;
                    }
                },
            );
        } else {
            tracing::info!("auto_rollout disabled, rollout_progress job not scheduled");
        }

        {
            let state = self.state.clone();
            scheduler.spawn(
                Job { name: "registry_auto_deprecate", interval: std::time::Duration::from_secs(3600) },
                move || {
                    let state = state.clone();
                    async move {
                        let deprecated = state.registry.auto_deprecate(Utc::now()).await;
                        for build_id in deprecated {
                            tracing::info!(%build_id, "build auto-deprecated");
                        }
                    }
                },
            );
        }

        {
            let state = self.state.clone();
            scheduler.spawn(
                Job { name: "version_watcher", interval: std::time::Duration::from_millis(self.config.update_pipeline.version_watcher.default_check_interval_ms) },
                move || {
                    let state = state.clone();
                    async move {
                        for event in state.version_watcher.check_all().await {
                            match event {
                                WatchEvent::VersionDiscovered { provider_id, version, source_url, .. } => {
                                    let record = VersionWatcher::to_version_record(provider_id, version.clone(), source_url);
                                    state.registry.register_version(record).await;
                                    state
                                        .hub
                                        .broadcast_event("version_discovered", Some(serde_json::json!({ "provider_id": provider_id, "version": version })))
                                        .await;
                                    if state.config.update_pipeline.auto_canary {
                                        let cases = fc_update::canary::default_suite_cases("version_discovery", provider_id);
                                        let fleet = state.fleet.clone();
                                        let run_id = state
                                            .canary
                                            .trigger_run(
                                                format!("version:{version}"),
                                                "version_discovery",
                                                &cases,
                                                provider_id,
                                                &state.config.update_pipeline.canary,
                                                move |_case| {
                                                    let fleet = fleet.clone();
                                                    async move {
                                                        let outcome = if fleet.select(provider_id, &[]).await.is_some() {
                                                            fc_update::canary::CaseOutcome::Passed
                                                        } else {
                                                            fc_update::canary::CaseOutcome::Errored
                                                        };
                                                        Ok(fc_update::canary::CaseAttempt {
                                                            outcome,
                                                            session_start_ms: None,
                                                            time_to_first_output_ms: None,
                                                            disconnected: false,
                                                        })
                                                    }
                                                },
                                            )
                                            .await;
                                        tracing::info!(%run_id, ?provider_id, "auto-canary run completed for newly discovered version");
                                    }
                                }
                                WatchEvent::CheckError { provider_id, message, .. } => {
                                    tracing::warn!(?provider_id, %message, "version check failed");
                                }
                            }
                        }
                    }
                },
            );
        }

        {
            let state = self.state.clone();
            scheduler.spawn(
                Job { name: "realtime_sweep", interval: std::time::Duration::from_millis(self.config.realtime.ping_interval_ms) },
                move || {
                    let state = state.clone();
                    async move {
                        let closed = state.hub.sweep_stale(Utc::now()).await;
                        if !closed.is_empty() {
                            tracing::debug!(count = closed.len(), "closed stale realtime connections");
                        }
                    }
                },
            );
        }

        {
            let state = self.state.clone();
            scheduler.spawn(
                Job { name: "session_timeout_watchdog", interval: std::time::Duration::from_secs(30) },
                move || {
                    let state = state.clone();
                    async move {
                        let now = Utc::now();
                        for session in state.sessions.list(None).await {
                            if session.state.is_terminal() {
                                continue;
                            }
                            let elapsed = now.signed_duration_since(session.started_at);
                            if elapsed.num_minutes() >= i64::from(session.timeout_minutes) {
                                state.sessions.report_state(session.session_id, SessionState::TimedOut).await;
                                state
                                    .hub
                                    .broadcast_session_event(
                                        session.session_id,
                                        fc_realtime::protocol::SessionAction::StateChange,
                                        serde_json::json!({ "state": "TIMED_OUT", "reason": "session exceeded its timeout" }),
                                    )
                                    .await;
                                tracing::warn!(session_id = %session.session_id, "session timed out");
                            }
                        }
                    }
                },
            );
        }
    }

    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        self.spawn_background_jobs();
        let app = crate::api::router(self.state.clone());
        let shutdown = self.shutdown.clone();
        tracing::info!(addr = %listener.local_addr()?, "fc-daemon listening");
        tokio::spawn(async move {
            let mut rx = shutdown.subscribe();
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.recv().await;
                })
                .await
            {
                tracing::error!(%err, "http server exited with error");
            }
        });

        let mut rx = self.shutdown.subscribe();
        let _ = rx.recv().await;
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = TcpListener::bind(&addr).await?;
        self.run_with_listener(listener).await
    }
}

/// Orgs are "eligible" for a channel's auto-progress when they're pinned to
/// no specific build and their configured channel matches the rollout's.
fn eligible_orgs(orgs: &[OrgRuntimeConfig], channel: Channel) -> Vec<OrgRuntimeConfig> {
    orgs.iter().filter(|o| o.channel == channel && o.pinned_build_id.is_none()).cloned().collect()
}

/// Bridges the Realtime Hub's `TerminalInput` events to the runner that is
/// actually executing the session, by looking up its current assignment and
/// queuing a [`RunnerCommand`] for delivery on that runner's next heartbeat.
fn spawn_terminal_input_forwarder(events: Arc<fc_realtime::event_bus::EventBus>, sessions: Arc<SessionCoordinator>, fleet: Arc<FleetManager>) {
    let rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            let InternalEvent::TerminalInput { session_id, data, .. } = event else {
                continue;
            };
            match sessions.get(session_id).await {
                Ok(session) => match session.runner_id {
                    Some(runner_id) => fleet.push_command(runner_id, RunnerCommand::TerminalInput { session_id, data }),
                    None => tracing::warn!(%session_id, "terminal input for session with no assigned runner"),
                },
                Err(err) => tracing::warn!(%session_id, %err, "terminal input for unknown session"),
            }
        }
    });
}
