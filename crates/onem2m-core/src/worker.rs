//! Background Worker Pool: named periodic workers and one-shot actors.
//!
//! Worker state lives in the handle's `data` field, mutated only
//! by the owning worker or by the scheduling edge that appends to it
//! (append-on-arrival, read-and-clear on tick) — nothing else touches it
//! concurrently. Cancellation is cooperative: `stop` sets a flag and wakes
//! the worker, but an in-flight tick always finishes. Task spawning follows
//! the same `tokio::spawn` idiom `cdk`'s mint uses for its background
//! fee/quote sweepers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use onem2m_common::Error;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

/// A tick/actor function: takes the worker's scratch data and runs once.
pub type WorkerFn = Arc<dyn Fn(Arc<Mutex<Value>>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Handle to a running (or completed) worker/actor. Cloning shares the same
/// underlying state; dropping all clones does not stop the worker — call
/// [`WorkerHandle::stop`] explicitly.
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    /// Mutable scratch space, e.g. accumulated `sur` values for a
    /// cross-resource subscription window.
    pub data: Arc<Mutex<Value>>,
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl WorkerHandle {
    fn new(name: &str, data: Value) -> Self {
        Self {
            name: Arc::from(name),
            data: Arc::new(Mutex::new(data)),
            stopped: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cooperative cancellation; wakes the worker if it is sleeping.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// The pool itself: a name-keyed registry of running workers/actors.
pub struct WorkerPool {
    workers: RwLock<HashMap<String, WorkerHandle>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("names", &self.workers.read().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Schedule a periodic task under `name`, replacing any prior worker of
    /// the same name (the old one is stopped first).
    pub fn new_worker(
        &self,
        name: &str,
        interval: Duration,
        start_with_delay: bool,
        data: Value,
        f: WorkerFn,
    ) -> WorkerHandle {
        self.stop_exact(name);
        let handle = WorkerHandle::new(name, data);
        self.workers.write().insert(name.to_string(), handle.clone());

        let task_handle = handle.clone();
        tokio::spawn(async move {
            if start_with_delay {
                tokio::time::sleep(interval).await;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; consume it
            loop {
                tokio::select! {
                    _ = task_handle.notify.notified() => {
                        if task_handle.is_stopped() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if task_handle.is_stopped() {
                            break;
                        }
                        if let Err(err) = f(task_handle.data.clone()).await {
                            warn!(name = %task_handle.name, error = %err, "worker tick failed");
                        }
                    }
                }
            }
        });

        handle
    }

    /// Schedule a one-shot task under `name`, firing once after `delay`.
    pub fn new_actor(&self, name: &str, delay: Duration, data: Value, f: WorkerFn) -> WorkerHandle {
        self.stop_exact(name);
        let handle = WorkerHandle::new(name, data);
        self.workers.write().insert(name.to_string(), handle.clone());

        let task_handle = handle.clone();
        let pool_name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_handle.notify.notified() => {}
                _ = tokio::time::sleep(delay) => {
                    if !task_handle.is_stopped() {
                        if let Err(err) = f(task_handle.data.clone()).await {
                            warn!(name = %task_handle.name, error = %err, "actor failed");
                        }
                    }
                }
            }
            task_handle.stopped.store(true, Ordering::Relaxed);
        });

        // The registry entry is reaped lazily: find_workers/stop_workers skip
        // finished actors via is_stopped(), and a future lookup by the same
        // name evicts it through stop_exact's replacement path.
        let _ = pool_name;
        handle
    }

    fn stop_exact(&self, name: &str) {
        if let Some(existing) = self.workers.write().remove(name) {
            existing.stop();
        }
    }

    /// Stop every worker/actor whose name matches `pattern` (`*`/`?` glob).
    /// Returns how many were stopped.
    pub fn stop_workers(&self, pattern: &str) -> usize {
        let mut workers = self.workers.write();
        let matching: Vec<String> = workers
            .keys()
            .filter(|name| glob_match(pattern, name))
            .cloned()
            .collect();
        for name in &matching {
            if let Some(handle) = workers.remove(name) {
                handle.stop();
            }
        }
        matching.len()
    }

    /// Return handles for every still-running worker/actor whose name
    /// matches `pattern`. A completed one-shot actor is excluded even though
    /// its registry entry is reaped lazily, so callers that re-arm a window
    /// by appending to an existing handle's `data` never resurrect a finished
    /// actor instead of starting a fresh one.
    pub fn find_workers(&self, pattern: &str) -> Vec<WorkerHandle> {
        self.workers
            .read()
            .iter()
            .filter(|(name, handle)| glob_match(pattern, name) && !handle.is_stopped())
            .map(|(_, handle)| handle.clone())
            .collect()
    }
}

/// `*`/`?` glob matching over worker names.
fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern == value;
    }
    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            _ => regex_str.push_str(&regex::escape(&ch.to_string())),
        }
    }
    regex_str.push('$');
    regex::Regex::new(&regex_str)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Duration as TokioDuration;

    #[tokio::test]
    async fn periodic_worker_ticks_and_mutates_scratch_data() {
        let pool = WorkerPool::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        let handle = pool.new_worker(
            "test-periodic",
            TokioDuration::from_millis(10),
            false,
            json!({"sur": []}),
            Arc::new(move |data| {
                let ticks_clone = ticks_clone.clone();
                Box::pin(async move {
                    ticks_clone.fetch_add(1, Ordering::Relaxed);
                    let mut guard = data.lock();
                    guard["sur"].as_array_mut().unwrap().push(json!("s1"));
                    Ok(())
                })
            }),
        );

        tokio::time::sleep(TokioDuration::from_millis(35)).await;
        handle.stop();
        assert!(ticks.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn stop_workers_matches_glob() {
        let pool = WorkerPool::new();
        pool.new_actor(
            "crs-window-ri1",
            Duration::from_secs(60),
            Value::Null,
            Arc::new(|_| Box::pin(async { Ok(()) })),
        );
        pool.new_actor(
            "crs-window-ri2",
            Duration::from_secs(60),
            Value::Null,
            Arc::new(|_| Box::pin(async { Ok(()) })),
        );
        pool.new_actor(
            "batch-guard-ri1",
            Duration::from_secs(60),
            Value::Null,
            Arc::new(|_| Box::pin(async { Ok(()) })),
        );

        let stopped = pool.stop_workers("crs-window-*");
        assert_eq!(stopped, 2);
        assert_eq!(pool.find_workers("*").len(), 1);
    }
}
