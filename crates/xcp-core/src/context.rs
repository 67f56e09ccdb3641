//! Template context: named values supplied to every template invocation.
//!
//! Entries are either eagerly materialized once or refreshed on a schedule
//! (fixed interval or cron expression) with bounded retry and backoff. On
//! refresh failure, a prior value is retained rather than surfaced to
//! in-flight requests; an entry with no prior value at startup fails
//! [`TemplateContext::initial_load`], which the caller should treat as a
//! fatal startup error.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type LoaderFn = Arc<dyn Fn() -> BoxFuture<Result<Value>> + Send + Sync>;

/// How a refreshable entry is re-materialized over time.
#[derive(Debug, Clone)]
pub enum RefreshSchedule {
    Interval(Duration),
    Cron(String),
}

/// Bounded retry policy applied to a single refresh attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub num_retries: u32,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { num_retries: 3, retry_interval: Duration::from_secs(1) }
    }
}

/// A single named context entry.
pub struct ContextEntry {
    name: String,
    loader: LoaderFn,
    schedule: Option<RefreshSchedule>,
    retry: RetryPolicy,
    current: ArcSwapOption<Value>,
    refresh_failures: AtomicU64,
}

impl ContextEntry {
    fn eager(name: &str, value: Value) -> Self {
        Self {
            name: name.to_string(),
            loader: Arc::new(move || {
                let value = value.clone();
                Box::pin(async move { Ok(value) })
            }),
            schedule: None,
            retry: RetryPolicy::default(),
            current: ArcSwapOption::from(None),
            refresh_failures: AtomicU64::new(0),
        }
    }

    async fn load_once(&self) -> Result<Value> {
        (self.loader)().await
    }

    /// Run the retry-wrapped refresh. Returns the freshly loaded value on
    /// success. On exhaustion, returns the prior value if one exists,
    /// otherwise the original error.
    async fn refresh(&self) -> Result<Value> {
        let mut last_err = None;
        for attempt in 0..=self.retry.num_retries {
            match self.load_once().await {
                Ok(value) => {
                    self.current.store(Some(Arc::new(value.clone())));
                    return Ok(value);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < self.retry.num_retries {
                        tokio::time::sleep(self.retry.retry_interval).await;
                    }
                }
            }
        }

        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(prior) = self.current.load_full() {
            warn!(entry = %self.name, "context_refresh_failed: retaining prior value");
            Ok((*prior).clone())
        } else {
            Err(last_err.unwrap_or_else(|| Error::internal("refresh failed with no error recorded")))
        }
    }
}

/// The full named-value mapping supplied to every template invocation.
#[derive(Default)]
pub struct TemplateContext {
    entries: HashMap<String, Arc<ContextEntry>>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value that never changes after startup.
    pub fn register_eager(&mut self, name: &str, value: Value) {
        self.entries.insert(name.to_string(), Arc::new(ContextEntry::eager(name, value)));
    }

    /// Register a refreshable entry backed by an async loader.
    pub fn register_refreshable<F, Fut>(
        &mut self,
        name: &str,
        schedule: RefreshSchedule,
        retry: RetryPolicy,
        loader: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let entry = ContextEntry {
            name: name.to_string(),
            loader: Arc::new(move || Box::pin(loader())),
            schedule: Some(schedule),
            retry,
            current: ArcSwapOption::from(None),
            refresh_failures: AtomicU64::new(0),
        };
        self.entries.insert(name.to_string(), Arc::new(entry));
    }

    /// Total refresh failures across every entry, counting retry exhaustion
    /// whether or not a prior value was available to fall back on.
    pub fn refresh_failed_total(&self) -> u64 {
        self.entries.values().map(|e| e.refresh_failures.load(Ordering::Relaxed)).sum()
    }

    /// Materialize every entry once. Fails if any entry without a prior
    /// value cannot be loaded — callers should treat this as fatal at
    /// startup.
    pub async fn initial_load(&self) -> Result<()> {
        for entry in self.entries.values() {
            entry.refresh().await?;
        }
        Ok(())
    }

    /// Re-materialize a single named entry according to its schedule and
    /// retry policy.
    pub async fn refresh(&self, name: &str) -> Result<()> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::internal(format!("no such context entry: {name}")))?;
        entry.refresh().await?;
        Ok(())
    }

    /// Current value of a named entry, if materialized.
    pub fn current(&self, name: &str) -> Option<Value> {
        self.entries.get(name)?.current.load_full().map(|v| (*v).clone())
    }

    /// The full context as a JSON object, one key per registered entry.
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        for (name, entry) in &self.entries {
            if let Some(value) = entry.current.load_full() {
                map.insert(name.clone(), (*value).clone());
            }
        }
        Value::Object(map)
    }

    /// The context filtered down to entries referenced by `free_identifiers`
    /// — keeps the fingerprint stable when unrelated context changes.
    pub fn pruned(&self, free_identifiers: &BTreeSet<String>) -> Value {
        let mut map = Map::new();
        for (name, entry) in &self.entries {
            if free_identifiers.contains(name) {
                if let Some(value) = entry.current.load_full() {
                    map.insert(name.clone(), (*value).clone());
                }
            }
        }
        Value::Object(map)
    }

    /// Spawn a background refresh task per scheduled entry. The returned
    /// handles keep running until the process exits; dropping them would
    /// abort the tasks.
    pub fn spawn_schedulers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.entries
            .values()
            .filter_map(|entry| {
                let schedule = entry.schedule.clone()?;
                let entry = entry.clone();
                Some(tokio::spawn(async move { run_schedule(entry, schedule).await }))
            })
            .collect()
    }
}

async fn run_schedule(entry: Arc<ContextEntry>, schedule: RefreshSchedule) {
    loop {
        let sleep_for = next_interval(&schedule);
        tokio::time::sleep(sleep_for).await;
        if let Err(e) = entry.refresh().await {
            warn!(entry = %entry.name, error = %e, "context_refresh_failed");
        }
    }
}

fn next_interval(schedule: &RefreshSchedule) -> Duration {
    match schedule {
        RefreshSchedule::Interval(d) => *d,
        RefreshSchedule::Cron(expr) => {
            use cron::Schedule;
            use std::str::FromStr;
            match Schedule::from_str(expr) {
                Ok(schedule) => {
                    let now = chrono::Utc::now();
                    schedule
                        .upcoming(chrono::Utc)
                        .next()
                        .map(|next| (next - now).to_std().unwrap_or(Duration::from_secs(60)))
                        .unwrap_or(Duration::from_secs(60))
                }
                Err(_) => Duration::from_secs(60),
            }
        }
    }
}
