//! Repeating-listing scheduler.
//!
//! Republishes offer/RFQ listings at a bounded interval without ever
//! extending their cryptographic validity: the job's `valid_until_unix` is
//! fixed when the job starts and overwrites whatever the frozen args say
//! on every run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::clock::{now_ms, now_unix};

pub const MIN_INTERVAL_SEC: u64 = 1;
pub const MAX_INTERVAL_SEC: u64 = 86_400;
pub const MIN_TTL_SEC: u64 = 10;
pub const MAX_TTL_SEC: u64 = 604_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutopostTool {
    PublishOffer,
    PublishRfq,
}

impl AutopostTool {
    pub fn as_str(self) -> &'static str {
        match self {
            AutopostTool::PublishOffer => "publish-offer",
            AutopostTool::PublishRfq => "publish-rfq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish-offer" => Some(AutopostTool::PublishOffer),
            "publish-rfq" => Some(AutopostTool::PublishRfq),
            _ => None,
        }
    }
}

/// The external publish operation a job invokes on each run.
#[async_trait]
pub trait ListingPublisher: Send + Sync {
    async fn publish(&self, tool: AutopostTool, args: &Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct StartParams {
    pub name: String,
    pub tool: AutopostTool,
    pub interval_sec: u64,
    pub ttl_sec: u64,
    /// Absolute expiry; defaults to `now + ttl_sec` and is never extended.
    pub valid_until_unix: Option<u64>,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub tool: AutopostTool,
    pub interval_sec: u64,
    pub ttl_sec: u64,
    pub valid_until_unix: u64,
    pub args: Value,
    pub runs: u64,
    pub started_at: u64,
    pub last_run_at: Option<u64>,
    pub last_ok: Option<bool>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub stopped: bool,
    pub reason: Option<&'static str>,
}

struct JobState {
    tool: AutopostTool,
    interval_sec: u64,
    ttl_sec: u64,
    valid_until_unix: u64,
    args: Value,
    runs: u64,
    started_at: u64,
    last_run_at: Option<u64>,
    last_ok: Option<bool>,
    last_error: Option<String>,
}

struct JobEntry {
    state: JobState,
    handle: JoinHandle<()>,
}

struct Inner {
    publisher: Arc<dyn ListingPublisher>,
    jobs: Mutex<HashMap<String, JobEntry>>,
}

/// Owns all autopost jobs. Jobs are in-memory only and die with the
/// process; `stop` and `shutdown` abort their timer tasks synchronously.
#[derive(Clone)]
pub struct AutopostManager {
    inner: Arc<Inner>,
}

impl AutopostManager {
    pub fn new(publisher: Arc<dyn ListingPublisher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                publisher,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates and registers a job, runs it once immediately, then keeps
    /// republishing every `interval_sec` until `valid_until_unix` passes.
    pub fn start(&self, params: StartParams) -> Result<JobStatus> {
        anyhow::ensure!(!params.name.is_empty(), "job name must not be empty");
        anyhow::ensure!(
            (MIN_TTL_SEC..=MAX_TTL_SEC).contains(&params.ttl_sec),
            "ttl_sec must be within [{MIN_TTL_SEC}, {MAX_TTL_SEC}], got {}",
            params.ttl_sec
        );

        let interval_sec = params.interval_sec.clamp(MIN_INTERVAL_SEC, MAX_INTERVAL_SEC);
        let now = now_unix();
        let valid_until_unix = params.valid_until_unix.unwrap_or(now + params.ttl_sec);
        let horizon = valid_until_unix
            .checked_sub(now)
            .context("valid_until_unix is already in the past")?;
        anyhow::ensure!(
            (MIN_TTL_SEC..=MAX_TTL_SEC).contains(&horizon),
            "validity horizon must be within [{MIN_TTL_SEC}, {MAX_TTL_SEC}] seconds, got {horizon}"
        );

        let mut jobs = self.inner.jobs.lock().expect("autopost jobs mutex poisoned");
        anyhow::ensure!(
            !jobs.contains_key(&params.name),
            "autopost job name already in use: {}",
            params.name
        );

        let state = JobState {
            tool: params.tool,
            interval_sec,
            ttl_sec: params.ttl_sec,
            valid_until_unix,
            // Deep snapshot: later mutation of the caller's value can not
            // leak into scheduled runs.
            args: params.args.clone(),
            runs: 0,
            started_at: now_ms(),
            last_run_at: None,
            last_ok: None,
            last_error: None,
        };
        let status = snapshot(&params.name, &state);

        let inner = self.inner.clone();
        let name = params.name.clone();
        let handle = tokio::spawn(run_job(inner, name.clone()));

        jobs.insert(name, JobEntry { state, handle });
        Ok(status)
    }

    /// Idempotent: stopping an unknown name reports `not_found` but is ok.
    pub fn stop(&self, name: &str) -> StopOutcome {
        let mut jobs = self.inner.jobs.lock().expect("autopost jobs mutex poisoned");
        match jobs.remove(name) {
            Some(entry) => {
                entry.handle.abort();
                StopOutcome {
                    stopped: true,
                    reason: None,
                }
            }
            None => StopOutcome {
                stopped: false,
                reason: Some("not_found"),
            },
        }
    }

    /// Snapshot of one job or of all jobs, newest first.
    pub fn status(&self, name: Option<&str>) -> Vec<JobStatus> {
        let jobs = self.inner.jobs.lock().expect("autopost jobs mutex poisoned");
        let mut out: Vec<JobStatus> = jobs
            .iter()
            .filter(|(job_name, _)| name.is_none_or(|n| n == job_name.as_str()))
            .map(|(job_name, entry)| snapshot(job_name, &entry.state))
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    pub fn shutdown(&self) {
        let mut jobs = self.inner.jobs.lock().expect("autopost jobs mutex poisoned");
        for (_, entry) in jobs.drain() {
            entry.handle.abort();
        }
    }
}

enum TickPlan {
    Run(AutopostTool, Value, u64),
    Expired,
    Gone,
}

async fn run_job(inner: Arc<Inner>, name: String) {
    loop {
        let plan = {
            let jobs = inner.jobs.lock().expect("autopost jobs mutex poisoned");
            match jobs.get(&name) {
                None => TickPlan::Gone,
                Some(entry) if now_unix() >= entry.state.valid_until_unix => TickPlan::Expired,
                Some(entry) => TickPlan::Run(
                    entry.state.tool,
                    build_run_args(&entry.state.args, entry.state.valid_until_unix),
                    entry.state.interval_sec,
                ),
            }
        };
        let (tool, run_args, interval_sec) = match plan {
            TickPlan::Gone => return,
            TickPlan::Expired => {
                tracing::info!(job = %name, "autopost job reached its validity horizon");
                inner
                    .jobs
                    .lock()
                    .expect("autopost jobs mutex poisoned")
                    .remove(&name);
                return;
            }
            TickPlan::Run(tool, run_args, interval_sec) => (tool, run_args, interval_sec),
        };

        let result = inner.publisher.publish(tool, &run_args).await;

        {
            let mut jobs = inner.jobs.lock().expect("autopost jobs mutex poisoned");
            if let Some(entry) = jobs.get_mut(&name) {
                entry.state.runs += 1;
                entry.state.last_run_at = Some(now_ms());
                match &result {
                    Ok(_) => {
                        entry.state.last_ok = Some(true);
                        entry.state.last_error = None;
                    }
                    Err(err) => {
                        entry.state.last_ok = Some(false);
                        entry.state.last_error = Some(format!("{err:#}"));
                        tracing::warn!(job = %name, error = %err, "autopost run failed");
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_millis((interval_sec * 1000).max(1000))).await;
    }
}

/// Rebuilds the published args from the frozen snapshot: any ttl hint is
/// stripped and `valid_until_unix` is forced to the job's fixed value, so
/// republishing never extends the listing's validity.
fn build_run_args(frozen: &Value, valid_until_unix: u64) -> Value {
    let mut args = frozen.clone();
    if let Value::Object(map) = &mut args {
        map.remove("ttl_sec");
        map.remove("ttl");
        map.insert("valid_until_unix".to_string(), Value::from(valid_until_unix));
    }
    args
}

fn snapshot(name: &str, state: &JobState) -> JobStatus {
    JobStatus {
        name: name.to_string(),
        tool: state.tool,
        interval_sec: state.interval_sec,
        ttl_sec: state.ttl_sec,
        valid_until_unix: state.valid_until_unix,
        args: state.args.clone(),
        runs: state.runs,
        started_at: state.started_at,
        last_run_at: state.last_run_at,
        last_ok: state.last_ok,
        last_error: state.last_error.clone(),
    }
}
