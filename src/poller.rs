//! Result and event polling.
//!
//! A sweep walks the live WUs round-robin, starting after the WU that
//! delivered the previous event, and stops at the first event found. Status
//! checks may shell out, so they run on the blocking pool in windows of
//! `status_workers` WUs and are joined back in sweep order.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DcConfig;
use crate::driver::{BackendDriver, OutputKind, PollStatus};
use crate::error::DcError;
use crate::mailbox::{BoxKind, Mailbox};
use crate::registry::{apply, Registry};
use crate::workunit::{WorkUnit, WuEvent, WuResult, WuState};

/// Something a WU produced.
#[derive(Debug, Clone)]
pub enum MasterEvent {
    /// Terminal result; the WU is FINISHED.
    Result(WuResult),
    SubResult(WuResult),
    /// Text the client posted to its master mailbox.
    Message { wu: String, message: String },
}

impl MasterEvent {
    pub fn wu_name(&self) -> &str {
        match self {
            MasterEvent::Result(result) | MasterEvent::SubResult(result) => &result.wu_name,
            MasterEvent::Message { wu, .. } => wu,
        }
    }
}

pub struct Poller {
    cursor: usize,
    interval: Duration,
    status_workers: usize,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(config: &DcConfig) -> Self {
        Self {
            cursor: 0,
            interval: config.poll_interval(),
            status_workers: config.status_workers.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that makes a blocked call return with no result.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Deliver at most one result to `on_result`.
    ///
    /// `timeout_secs < 0` sweeps once, `0` waits until a result arrives and
    /// a positive value waits at most that many seconds. Returns the number
    /// of results delivered.
    pub async fn check_for_result<F>(
        &mut self,
        registry: &mut Registry,
        timeout_secs: i64,
        mut on_result: F,
    ) -> Result<usize, DcError>
    where
        F: FnMut(WuResult),
    {
        match self.wait(registry, timeout_secs, None, false).await? {
            Some(MasterEvent::Result(result) | MasterEvent::SubResult(result)) => {
                on_result(result);
                Ok(1)
            }
            Some(MasterEvent::Message { .. }) | None => Ok(0),
        }
    }

    /// Like [`check_for_result`](Self::check_for_result), but also reports
    /// client messages.
    pub async fn wait_for_event(
        &mut self,
        registry: &mut Registry,
        timeout_secs: i64,
    ) -> Result<Option<MasterEvent>, DcError> {
        self.wait(registry, timeout_secs, None, true).await
    }

    /// Wait for an event of one WU only.
    pub async fn wait_for_wu_event(
        &mut self,
        registry: &mut Registry,
        name: &str,
        timeout_secs: i64,
    ) -> Result<Option<MasterEvent>, DcError> {
        registry.get(name)?;
        self.wait(registry, timeout_secs, Some(name), true).await
    }

    async fn wait(
        &mut self,
        registry: &mut Registry,
        timeout_secs: i64,
        only: Option<&str>,
        messages: bool,
    ) -> Result<Option<MasterEvent>, DcError> {
        // A deadline past the clock's range waits like a blocking call.
        let deadline = (timeout_secs > 0)
            .then(|| {
                Instant::now().checked_add(Duration::from_secs(timeout_secs.unsigned_abs()))
            })
            .flatten();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            if let Some(event) = self.sweep(registry, only, messages).await? {
                return Ok(Some(event));
            }
            if timeout_secs < 0 {
                return Ok(None);
            }
            if !has_pollable(registry, only) {
                debug!("no work unit left to poll");
                return Ok(None);
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = sleep_until(deadline) => return Ok(None),
                        _ = ticker.tick() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = ticker.tick() => {}
                    }
                }
            }
        }
    }

    async fn sweep(
        &mut self,
        registry: &mut Registry,
        only: Option<&str>,
        messages: bool,
    ) -> Result<Option<MasterEvent>, DcError> {
        let names: Vec<String> = match only {
            Some(name) => vec![name.to_string()],
            None => registry.names().to_vec(),
        };
        if names.is_empty() {
            return Ok(None);
        }

        let start = self.cursor % names.len();
        let mut order = Vec::with_capacity(names.len());
        for step in 0..names.len() {
            let index = (start + step) % names.len();
            if registry.get(&names[index])?.state.is_pollable() {
                order.push((index, names[index].clone()));
            }
        }

        let driver = registry.driver();
        for window in order.chunks(self.status_workers) {
            let mut handles = Vec::with_capacity(window.len());
            for (_, name) in window {
                let wu = registry.get(name)?.clone();
                let driver = Arc::clone(&driver);
                handles.push(tokio::task::spawn_blocking(move || driver.poll_status(&wu)));
            }

            let mut statuses = Vec::with_capacity(handles.len());
            for handle in handles {
                statuses.push(handle.await.map_err(|e| {
                    DcError::Internal(format!("status worker failed: {e}"))
                })?);
            }

            for ((index, name), status) in window.iter().zip(statuses) {
                if let Some(event) = observe(registry, &driver, name, status, messages).await? {
                    if only.is_none() {
                        self.cursor = index + 1;
                    }
                    return Ok(Some(event));
                }
            }
        }
        Ok(None)
    }
}

fn has_pollable(registry: &Registry, only: Option<&str>) -> bool {
    match only {
        Some(name) => registry
            .get(name)
            .map(|wu| wu.state.is_pollable())
            .unwrap_or(false),
        None => registry
            .names()
            .iter()
            .filter_map(|name| registry.get(name).ok())
            .any(|wu| wu.state.is_pollable()),
    }
}

/// Fold one status observation into the WU and produce its event, if any.
async fn observe(
    registry: &mut Registry,
    driver: &Arc<dyn BackendDriver>,
    name: &str,
    status: Result<PollStatus, DcError>,
    messages: bool,
) -> Result<Option<MasterEvent>, DcError> {
    let status = match status {
        Ok(status) if !status.is_anomaly() => status,
        Ok(status) => {
            note_anomaly(registry, name, &format!("{status:?}"))?;
            return Ok(None);
        }
        Err(err) => {
            note_anomaly(registry, name, &err.to_string())?;
            return Ok(None);
        }
    };

    let wu = registry.get_mut(name)?;
    wu.anomaly_streak = 0;
    if status != PollStatus::Queued {
        mark_started(wu)?;
    }

    match status {
        PollStatus::Finished => {
            if let Some(event) = drain_before_final(registry, driver, name, messages).await? {
                return Ok(Some(event));
            }
            let snapshot = registry.get(name)?.clone();
            let mut result = match fetch(driver, snapshot, OutputKind::Final).await {
                Ok(result) => result,
                Err(err) => {
                    note_anomaly(registry, name, &format!("cannot fetch output: {err}"))?;
                    return Ok(None);
                }
            };
            let wu = registry.get(name)?;
            let resolved = registry
                .stager()
                .resolve_outputs(&wu.outputs, &result.output_dir);
            for (logical_name, path) in resolved {
                result.outputs.entry(logical_name).or_insert(path);
            }

            let wu = registry.get_mut(name)?;
            apply(wu, WuEvent::Finish)?;
            info!(
                wu = %name,
                status = %result.status,
                exit_code = ?result.exit_code,
                "work unit finished"
            );
            Ok(Some(MasterEvent::Result(result)))
        }
        PollStatus::StillRunning => {
            if messages {
                return take_message(registry, driver, name);
            }
            Ok(None)
        }
        PollStatus::SubresultReady => {
            if messages && let Some(event) = take_message(registry, driver, name)? {
                return Ok(Some(event));
            }
            match take_subresult(registry, driver, name).await? {
                Subresult::Delivered(event) => Ok(Some(event)),
                Subresult::Discarded => Ok(None),
                Subresult::Unavailable(err) => {
                    warn!(wu = %name, error = %err, "cannot fetch sub-result");
                    Ok(None)
                }
            }
        }
        _ => Ok(None),
    }
}

/// Entries a finished job left behind go out before its FINAL; the job is
/// polled again on the next sweep.
async fn drain_before_final(
    registry: &mut Registry,
    driver: &Arc<dyn BackendDriver>,
    name: &str,
    messages: bool,
) -> Result<Option<MasterEvent>, DcError> {
    if messages && let Some(event) = take_message(registry, driver, name)? {
        return Ok(Some(event));
    }
    if !driver.capabilities().subresults {
        return Ok(None);
    }
    loop {
        match take_subresult(registry, driver, name).await? {
            Subresult::Delivered(event) => return Ok(Some(event)),
            Subresult::Discarded => continue,
            Subresult::Unavailable(err) => {
                debug!(wu = %name, error = %err, "no sub-result left");
                return Ok(None);
            }
        }
    }
}

fn mark_started(wu: &mut WorkUnit) -> Result<(), DcError> {
    match wu.state {
        WuState::Submitted => apply(wu, WuEvent::Start),
        WuState::Unknown => {
            info!(wu = %wu.name, "work unit recovered");
            apply(wu, WuEvent::Recover)
        }
        _ => Ok(()),
    }
}

fn note_anomaly(registry: &mut Registry, name: &str, reason: &str) -> Result<(), DcError> {
    let wu = registry.get_mut(name)?;
    wu.anomaly_streak += 1;
    if wu.anomaly_streak < 2 {
        warn!(wu = %name, reason, "polling anomaly");
        return apply(wu, WuEvent::Anomaly);
    }

    warn!(wu = %name, reason, "repeated polling anomaly, recreating work unit");
    registry
        .recreate(name)
        .map_err(|err| DcError::Internal(format!("recreate of {name} failed: {err}")))?;
    Ok(())
}

fn take_message(
    registry: &Registry,
    driver: &Arc<dyn BackendDriver>,
    name: &str,
) -> Result<Option<MasterEvent>, DcError> {
    if !driver.capabilities().messaging {
        return Ok(None);
    }
    let wu = registry.get(name)?;
    match Mailbox::open(&wu.workdir, BoxKind::Master).take_message() {
        Ok(message) => Ok(message.map(|message| MasterEvent::Message {
            wu: name.to_string(),
            message,
        })),
        Err(err) => {
            warn!(wu = %name, error = %err, "cannot read client message");
            Ok(None)
        }
    }
}

enum Subresult {
    Delivered(MasterEvent),
    /// Consumed past the budget.
    Discarded,
    Unavailable(DcError),
}

async fn take_subresult(
    registry: &mut Registry,
    driver: &Arc<dyn BackendDriver>,
    name: &str,
) -> Result<Subresult, DcError> {
    let snapshot = registry.get(name)?.clone();
    let budget_left = snapshot.subresult_budget_left();
    let result = match fetch(driver, snapshot, OutputKind::Partial).await {
        Ok(result) => result,
        Err(err) => return Ok(Subresult::Unavailable(err)),
    };

    if budget_left == 0 {
        warn!(wu = %name, "sub-result budget exhausted, discarding");
        if let Err(err) = std::fs::remove_dir_all(&result.output_dir) {
            debug!(wu = %name, error = %err, "cannot remove discarded sub-result");
        }
        return Ok(Subresult::Discarded);
    }

    registry.get_mut(name)?.subresults_delivered += 1;
    debug!(wu = %name, outputs = result.outputs.len(), "sub-result delivered");
    Ok(Subresult::Delivered(MasterEvent::SubResult(result)))
}

async fn fetch(
    driver: &Arc<dyn BackendDriver>,
    wu: WorkUnit,
    kind: OutputKind,
) -> Result<WuResult, DcError> {
    let driver = Arc::clone(driver);
    tokio::task::spawn_blocking(move || driver.fetch_output(&wu, kind))
        .await
        .map_err(|e| DcError::Internal(format!("output worker failed: {e}")))?
}
