//! Startup reconciliation, incremental ticks and periodic full refresh.
//!
//! [`Scheduler`] is the in-memory state machine. The `run_*` functions below it
//! drive one phase against real paths: they load the persisted state, run the
//! phase, save the state back and append an audit line.

use crate::sync::audit;
use crate::sync::checkpoint::{Checkpoint, CheckpointTracker};
use crate::sync::config::SyncConfig;
use crate::sync::event_log::EventLog;
use crate::sync::migrate::{MigrationReport, Migrator};
use crate::sync::paths::SyncPaths;
use crate::sync::reconcile::{ReconcileReport, ReconcileSettings, Reconciler};
use crate::sync::resolver::resolve;
use crate::sync::source::SourceOfTruth;
use crate::sync::state::{self, SyncState};
use crate::sync::store::Store;
use crate::sync::util::now_epoch_secs;
use crate::sync::warehouse::Warehouse;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub reconcile: ReconcileSettings,
    pub poll_interval_secs: u64,
    pub overlap_secs: u64,
    pub full_refresh_every_ticks: u64,
    pub startup_refresh_retained: bool,
    pub migrate_batch: usize,
}

impl SyncSettings {
    pub fn from_config(cfg: &SyncConfig) -> Self {
        Self {
            reconcile: ReconcileSettings {
                trusted_generator: cfg.reconcile.trusted_generator.clone(),
                placeholder_name: cfg.migrate.placeholder_name.clone(),
                conflict_retries: cfg.reconcile.conflict_retries,
            },
            poll_interval_secs: cfg.scheduler.poll_interval_secs,
            overlap_secs: cfg.scheduler.overlap_secs,
            full_refresh_every_ticks: cfg.scheduler.full_refresh_every_ticks,
            startup_refresh_retained: cfg.scheduler.startup_refresh_retained,
            migrate_batch: cfg.migrate.batch,
        }
    }
}

/// The three systems plus the knobs that govern syncing between them.
pub struct SyncContext<W, E, S> {
    pub warehouse: Warehouse<W>,
    pub events: EventLog<E>,
    pub source: S,
    pub settings: SyncSettings,
}

impl<W: Store, E: Store, S: SourceOfTruth> SyncContext<W, E, S> {
    pub fn reconciler(&self, now: DateTime<Utc>) -> Reconciler<'_, W, E, S> {
        Reconciler::new(
            &self.warehouse,
            &self.events,
            &self.source,
            &self.settings.reconcile,
            now,
        )
    }

    pub fn migrator(&self) -> Migrator<'_, W, E> {
        Migrator::new(
            &self.warehouse,
            &self.events,
            &self.settings.reconcile.trusted_generator,
            &self.settings.reconcile.placeholder_name,
            self.settings.migrate_batch,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupOutcome {
    pub retained_refresh: Option<ReconcileReport>,
    pub unknown_ids: usize,
    pub from_source_index: ReconcileReport,
    pub from_event_log: ReconcileReport,
}

impl StartupOutcome {
    pub fn failed(&self) -> usize {
        self.from_source_index.failed()
            + self.from_event_log.failed()
            + self.retained_refresh.as_ref().map_or(0, ReconcileReport::failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickOutcome {
    pub since: Checkpoint,
    pub committed: Checkpoint,
    pub events: usize,
    pub report: ReconcileReport,
    pub full_refresh: Option<ReconcileReport>,
}

pub struct Scheduler<'a, W, E, S> {
    ctx: &'a SyncContext<W, E, S>,
    tracker: CheckpointTracker,
    ticks_since_refresh: u64,
}

impl<'a, W: Store, E: Store, S: SourceOfTruth> Scheduler<'a, W, E, S> {
    pub fn new(ctx: &'a SyncContext<W, E, S>, state: &SyncState) -> Self {
        Self {
            ctx,
            tracker: CheckpointTracker::new(ctx.settings.overlap_secs, state.checkpoint.clone()),
            ticks_since_refresh: state.ticks_since_refresh,
        }
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.tracker.since()
    }

    pub fn ticks_since_refresh(&self) -> u64 {
        self.ticks_since_refresh
    }

    /// Fills warehouse gaps from the full id populations. Ids found in the
    /// source index go first; the event-log pass then skips whatever the first
    /// pass already wrote.
    pub fn startup(&mut self, now: DateTime<Utc>) -> Result<StartupOutcome> {
        if self.tracker.since().is_none() {
            let marker = self.tracker.next_checkpoint(now);
            tracing::info!(
                marker = %marker,
                "no persisted checkpoint; incremental scans start at the startup marker"
            );
            self.tracker.commit(marker);
        }

        let retained_refresh = if self.ctx.settings.startup_refresh_retained {
            Some(self.refresh_retained(now)?)
        } else {
            None
        };

        let sets = resolve(&self.ctx.warehouse, &self.ctx.events, &self.ctx.source)
            .context("startup id resolution failed")?;
        let unknown_ids = sets.unknown().len();
        let reconciler = self.ctx.reconciler(now);
        let from_source_index = reconciler.reconcile_ids(sets.missing_from_source_index());
        let from_event_log =
            reconciler.reconcile_ids(sets.missing_from_event_log(&from_source_index.written));
        tracing::info!(
            unknown_ids,
            source_index = %from_source_index.summary(),
            event_log = %from_event_log.summary(),
            "startup reconciliation finished"
        );

        Ok(StartupOutcome {
            retained_refresh,
            unknown_ids,
            from_source_index,
            from_event_log,
        })
    }

    /// One incremental scan. The next marker is taken before the scan starts
    /// and committed only after reconciliation has finished.
    pub fn incremental_tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let next = self.tracker.next_checkpoint(now);
        let since = self
            .tracker
            .since()
            .cloned()
            .unwrap_or_else(|| next.clone());

        let events = self
            .ctx
            .events
            .events_since(Some(&since))
            .with_context(|| format!("event scan since {since} failed"))?;
        let report = self.ctx.reconciler(now).reconcile_events(&events);
        self.tracker.commit(next.clone());
        self.ticks_since_refresh += 1;
        tracing::info!(
            since = %since,
            next = %next,
            events = events.len(),
            summary = %report.summary(),
            "incremental tick finished"
        );

        let refresh_due = self.ticks_since_refresh >= self.ctx.settings.full_refresh_every_ticks;
        let full_refresh = if refresh_due {
            Some(self.full_refresh(now)?)
        } else {
            None
        };

        Ok(TickOutcome {
            since,
            committed: next,
            events: events.len(),
            report,
            full_refresh,
        })
    }

    /// Reconciles every retained id, independent of events, and resets the
    /// refresh cadence.
    pub fn full_refresh(&mut self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let report = self.refresh_retained(now)?;
        self.ticks_since_refresh = 0;
        Ok(report)
    }

    fn refresh_retained(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let retained = self
            .ctx
            .warehouse
            .retained_ids()
            .context("retained id scan failed")?;
        let report = self.ctx.reconciler(now).reconcile_ids(retained);
        tracing::info!(summary = %report.summary(), "full refresh finished");
        Ok(report)
    }

    pub fn persist_into(&self, state: &mut SyncState) {
        state.checkpoint = self.checkpoint().cloned();
        state.ticks_since_refresh = self.ticks_since_refresh();
    }
}

fn startup_message(outcome: &StartupOutcome) -> String {
    format!(
        "unknown_ids={} source_index[{}] event_log[{}]",
        outcome.unknown_ids,
        outcome.from_source_index.summary(),
        outcome.from_event_log.summary()
    )
}

fn tick_message(outcome: &TickOutcome) -> String {
    format!(
        "since={} committed={} events={} {}",
        outcome.since,
        outcome.committed,
        outcome.events,
        outcome.report.summary()
    )
}

fn persist<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    state: &mut SyncState,
    scheduler: &Scheduler<'_, W, E, S>,
) -> Result<()> {
    scheduler.persist_into(state);
    state::save(paths, state)?;
    Ok(())
}

fn record_failure(paths: &SyncPaths, phase: &str, err: &anyhow::Error) {
    tracing::error!(phase, error = %format!("{err:#}"), "sync phase failed");
    if let Err(audit_err) = audit::append_event(paths, phase, "failed", &format!("{err:#}")) {
        tracing::warn!(error = %audit_err, "audit append failed");
    }
}

fn record_startup<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    state: &mut SyncState,
    scheduler: &mut Scheduler<'_, W, E, S>,
) -> Result<StartupOutcome> {
    let outcome = match scheduler.startup(Utc::now()) {
        Ok(outcome) => outcome,
        Err(err) => {
            record_failure(paths, "startup", &err);
            return Err(err);
        }
    };
    if outcome.retained_refresh.is_some() {
        state.last_full_refresh_epoch_secs = Some(now_epoch_secs()?);
    }
    persist(paths, state, scheduler)?;
    audit::append_event(
        paths,
        "startup",
        audit::status_for(outcome.failed()),
        &startup_message(&outcome),
    )?;
    Ok(outcome)
}

fn record_tick<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    state: &mut SyncState,
    scheduler: &mut Scheduler<'_, W, E, S>,
) -> Result<TickOutcome> {
    let outcome = match scheduler.incremental_tick(Utc::now()) {
        Ok(outcome) => outcome,
        Err(err) => {
            record_failure(paths, "tick", &err);
            return Err(err);
        }
    };
    let now = now_epoch_secs()?;
    state.last_tick_epoch_secs = Some(now);
    if let Some(refresh) = &outcome.full_refresh {
        state.last_full_refresh_epoch_secs = Some(now);
        audit::append_event(
            paths,
            "full-refresh",
            audit::status_for(refresh.failed()),
            &refresh.summary(),
        )?;
    }
    persist(paths, state, scheduler)?;
    audit::append_event(
        paths,
        "tick",
        audit::status_for(outcome.report.failed()),
        &tick_message(&outcome),
    )?;
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonOutcome {
    pub startup: StartupOutcome,
    pub last_tick: TickOutcome,
    pub ticks: u64,
}

/// Startup followed by incremental ticks forever, or exactly one tick with
/// `once`. Any tick-level failure ends the loop with an error.
pub fn run_daemon<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    ctx: &SyncContext<W, E, S>,
    once: bool,
) -> Result<DaemonOutcome> {
    let mut state = state::load(paths)?;
    let mut scheduler = Scheduler::new(ctx, &state);
    let startup = record_startup(paths, &mut state, &mut scheduler)?;
    let poll = Duration::from_secs(ctx.settings.poll_interval_secs);
    let mut ticks = 0;
    loop {
        let tick = record_tick(paths, &mut state, &mut scheduler)?;
        ticks += 1;
        if once {
            return Ok(DaemonOutcome {
                startup,
                last_tick: tick,
                ticks,
            });
        }
        tracing::debug!(sleep_secs = poll.as_secs(), "waiting for next tick");
        thread::sleep(poll);
    }
}

pub fn run_startup<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    ctx: &SyncContext<W, E, S>,
) -> Result<StartupOutcome> {
    let mut state = state::load(paths)?;
    let mut scheduler = Scheduler::new(ctx, &state);
    record_startup(paths, &mut state, &mut scheduler)
}

pub fn run_tick<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    ctx: &SyncContext<W, E, S>,
) -> Result<TickOutcome> {
    let mut state = state::load(paths)?;
    let mut scheduler = Scheduler::new(ctx, &state);
    record_tick(paths, &mut state, &mut scheduler)
}

pub fn run_full_refresh<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    ctx: &SyncContext<W, E, S>,
) -> Result<ReconcileReport> {
    let mut state = state::load(paths)?;
    let mut scheduler = Scheduler::new(ctx, &state);
    let report = match scheduler.full_refresh(Utc::now()) {
        Ok(report) => report,
        Err(err) => {
            record_failure(paths, "full-refresh", &err);
            return Err(err);
        }
    };
    state.last_full_refresh_epoch_secs = Some(now_epoch_secs()?);
    persist(paths, &mut state, &scheduler)?;
    audit::append_event(
        paths,
        "full-refresh",
        audit::status_for(report.failed()),
        &report.summary(),
    )?;
    Ok(report)
}

pub fn run_migration<W: Store, E: Store, S: SourceOfTruth>(
    paths: &SyncPaths,
    ctx: &SyncContext<W, E, S>,
) -> Result<MigrationReport> {
    let migrated = ctx
        .migrator()
        .run(Utc::now())
        .context("placeholder migration failed");
    let report = match migrated {
        Ok(report) => report,
        Err(err) => {
            record_failure(paths, "migrate", &err);
            return Err(err);
        }
    };
    let mut state = state::load(paths)?;
    state.last_migration_epoch_secs = Some(now_epoch_secs()?);
    state::save(paths, &state)?;
    let status = if report.stalled || report.failed > 0 {
        "degraded"
    } else {
        "ok"
    };
    audit::append_event(paths, "migrate", status, &report.summary())?;
    Ok(report)
}
