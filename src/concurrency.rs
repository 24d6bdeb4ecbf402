// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-job-type admission control.
//!
//! Each configured job type has a slot with `max` concurrent permits and a
//! strict FIFO queue of waiters. A released permit is handed directly to the
//! head of the queue, so a newcomer can never overtake a waiter.
//!
//! ```text
//!  acquire("email") ── running < max && queue empty ──► permit (no wait)
//!         │
//!         └── otherwise ──► queue.push_back(tx) ──► await rx
//!                                                     ▲
//!  permit dropped ── running <= max ── pop head ──────┘ (slot handed over)
//! ```
//!
//! Unknown job types are admitted without limit. [`ConcurrencyController::reset`]
//! rejects every queued waiter with [`ConcurrencyError::Reset`]; permits
//! issued before the reset release nothing.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("Concurrency slots for '{0}' were reset while waiting")]
    Reset(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub max_concurrent: usize,
    pub current_running: usize,
    pub queue_depth: usize,
    pub utilization_pct: f64,
}

struct Slot {
    max: usize,
    running: usize,
    queue: VecDeque<oneshot::Sender<()>>,
    generation: u64,
}

impl Slot {
    fn new(max: usize) -> Self {
        Self {
            max,
            running: 0,
            queue: VecDeque::new(),
            generation: 0,
        }
    }

    fn queue_depth(&self) -> usize {
        self.queue.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Give a free slot to the first waiter still listening.
    fn grant_next(&mut self) -> bool {
        while let Some(tx) = self.queue.pop_front() {
            if tx.send(()).is_ok() {
                self.running += 1;
                return true;
            }
        }
        false
    }
}

struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Inner {
    fn release(&self, job_type: &str, generation: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(job_type) else { return };
        if slot.generation != generation {
            return;
        }
        slot.running = slot.running.saturating_sub(1);
        if slot.running < slot.max {
            slot.grant_next();
        }
        crate::metrics::set_concurrency_slot(job_type, slot.running, slot.queue_depth());
    }
}

/// Shared admission controller. Cloning is cheap.
#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<Inner>,
}

impl ConcurrencyController {
    #[must_use]
    pub fn new(limits: &HashMap<String, usize>) -> Self {
        let slots = limits
            .iter()
            .map(|(job, max)| (job.clone(), Slot::new(*max)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(slots),
            }),
        }
    }

    /// Wait for a permit for `job_type`. The slot is released when the
    /// permit is dropped. Cancelling the returned future gives up the place
    /// in the queue.
    pub async fn acquire(&self, job_type: &str) -> Result<ConcurrencyPermit, ConcurrencyError> {
        let (rx, generation) = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(job_type) else {
                warn!(job_type = %job_type, "No concurrency limit configured; admitting without limit");
                crate::metrics::record_concurrency_unbounded(job_type);
                return Ok(ConcurrencyPermit::unbounded(job_type));
            };

            // Waiters that gave up still hold a closed sender
            slot.queue.retain(|tx| !tx.is_closed());
            if slot.running < slot.max && slot.queue.is_empty() {
                slot.running += 1;
                crate::metrics::set_concurrency_slot(job_type, slot.running, slot.queue.len());
                return Ok(self.permit(job_type, slot.generation));
            }

            let (tx, rx) = oneshot::channel();
            slot.queue.push_back(tx);
            debug!(job_type = %job_type, queued = slot.queue.len(), "Waiting for concurrency slot");
            crate::metrics::set_concurrency_slot(job_type, slot.running, slot.queue.len());
            (rx, slot.generation)
        };

        let started = Instant::now();
        let mut pending = PendingAcquire {
            inner: Arc::clone(&self.inner),
            job_type,
            generation,
            rx,
            settled: false,
        };
        let outcome = (&mut pending.rx).await;
        pending.settled = true;
        crate::metrics::record_concurrency_wait(job_type, started.elapsed());

        match outcome {
            Ok(()) => Ok(self.permit(job_type, generation)),
            Err(_) => Err(ConcurrencyError::Reset(job_type.to_string())),
        }
    }

    /// Run `work` under a permit for `job_type`; the slot is freed however
    /// `work` ends.
    pub async fn run<F, T>(&self, job_type: &str, work: F) -> Result<T, ConcurrencyError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(job_type).await?;
        Ok(work.await)
    }

    fn permit(&self, job_type: &str, generation: u64) -> ConcurrencyPermit {
        ConcurrencyPermit {
            inner: Some(Arc::clone(&self.inner)),
            job_type: job_type.to_string(),
            generation,
        }
    }

    /// Change the limit for `job_type` (adding it if unknown). Running work
    /// is untouched; queued waiters are admitted as permits are released.
    pub fn update_limits(&self, job_type: &str, max_concurrent: usize) {
        let mut slots = self.inner.slots.lock();
        let slot = slots
            .entry(job_type.to_string())
            .or_insert_with(|| Slot::new(max_concurrent));
        let previous = slot.max;
        slot.max = max_concurrent;
        info!(job_type = %job_type, previous, max_concurrent, "Concurrency limit updated");
    }

    #[must_use]
    pub fn get_status(&self) -> BTreeMap<String, SlotStatus> {
        self.inner
            .slots
            .lock()
            .iter()
            .map(|(job, slot)| {
                let utilization_pct = if slot.max == 0 {
                    100.0
                } else {
                    slot.running as f64 / slot.max as f64 * 100.0
                };
                (
                    job.clone(),
                    SlotStatus {
                        max_concurrent: slot.max,
                        current_running: slot.running,
                        queue_depth: slot.queue_depth(),
                        utilization_pct,
                    },
                )
            })
            .collect()
    }

    /// Zero every counter and reject every queued waiter.
    pub fn reset(&self) {
        let mut slots = self.inner.slots.lock();
        let mut rejected = 0usize;
        for (job, slot) in slots.iter_mut() {
            rejected += slot.queue.len();
            slot.queue.clear();
            slot.running = 0;
            slot.generation += 1;
            crate::metrics::set_concurrency_slot(job, 0, 0);
        }
        warn!(rejected, "Concurrency controller reset");
    }
}

/// Queue entry that gives its slot back if it is dropped right after being
/// granted one.
struct PendingAcquire<'a> {
    inner: Arc<Inner>,
    job_type: &'a str,
    generation: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.inner.release(self.job_type, self.generation);
        }
    }
}

/// Held while a unit of work runs. Dropping it frees the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ConcurrencyPermit {
    /// `None` for job types without a limit
    inner: Option<Arc<Inner>>,
    job_type: String,
    generation: u64,
}

impl ConcurrencyPermit {
    fn unbounded(job_type: &str) -> Self {
        Self {
            inner: None,
            job_type: job_type.to_string(),
            generation: 0,
        }
    }

    #[must_use]
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.inner.is_none()
    }

    /// Release explicitly; same as dropping.
    pub fn release(self) {}
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release(&self.job_type, self.generation);
        }
    }
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("job_type", &self.job_type)
            .field("generation", &self.generation)
            .field("unbounded", &self.inner.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn controller(job: &str, max: usize) -> ConcurrencyController {
        ConcurrencyController::new(&HashMap::from([(job.to_string(), max)]))
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let ctl = controller("export", 2);
        let first = ctl.acquire("export").await.unwrap();
        let _second = ctl.acquire("export").await.unwrap();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.acquire("export").await })
        };
        settle().await;
        assert!(!waiter.is_finished());
        let status = &ctl.get_status()["export"];
        assert_eq!((status.current_running, status.queue_depth), (2, 1));
        assert_eq!(status.utilization_pct, 100.0);

        first.release();
        let third = waiter.await.unwrap().unwrap();
        assert_eq!(ctl.get_status()["export"].current_running, 2);
        drop(third);
        assert_eq!(ctl.get_status()["export"].current_running, 1);
    }

    #[tokio::test]
    async fn test_waiters_admitted_in_fifo_order() {
        let ctl = controller("email", 1);
        let holder = ctl.acquire("email").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for id in 0..4 {
            let ctl = ctl.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = ctl.acquire("email").await.unwrap();
                tx.send(id).unwrap();
            });
            settle().await;
        }
        drop(holder);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_running_never_exceeds_limit() {
        let ctl = controller("report", 3);
        let peak = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ctl = ctl.clone();
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                ctl.run("report", async {
                    {
                        let running = ctl.get_status()["report"].current_running;
                        let mut peak = peak.lock();
                        *peak = (*peak).max(running);
                    }
                    tokio::task::yield_now().await;
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(*peak.lock() <= 3);
        assert_eq!(ctl.get_status()["report"].current_running, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_unbounded() {
        let ctl = controller("email", 1);
        let permits: Vec<_> = futures::future::join_all((0..10).map(|_| ctl.acquire("misc"))).await;
        assert!(permits.iter().all(|p| p.as_ref().is_ok_and(ConcurrencyPermit::is_unbounded)));
        assert!(!ctl.get_status().contains_key("misc"));
    }

    #[tokio::test]
    async fn test_reset_rejects_waiters_and_ignores_stale_permits() {
        let ctl = controller("sync", 1);
        let stale = ctl.acquire("sync").await.unwrap();
        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.acquire("sync").await })
        };
        settle().await;

        ctl.reset();
        assert_eq!(waiter.await.unwrap().unwrap_err(), ConcurrencyError::Reset("sync".into()));

        let fresh = ctl.acquire("sync").await.unwrap();
        drop(stale); // Belongs to the previous generation
        assert_eq!(ctl.get_status()["sync"].current_running, 1);
        drop(fresh);
        assert_eq!(ctl.get_status()["sync"].current_running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let ctl = controller("sync", 1);
        let holder = ctl.acquire("sync").await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), ctl.acquire("sync")).await;
        assert!(timed_out.is_err());
        assert_eq!(ctl.get_status()["sync"].queue_depth, 0);

        drop(holder);
        assert_eq!(ctl.get_status()["sync"].current_running, 0);
        let next = tokio::time::timeout(Duration::from_millis(10), ctl.acquire("sync")).await;
        assert!(next.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newcomer_not_queued_behind_timed_out_waiter() {
        let ctl = controller("sync", 1);
        let holder = ctl.acquire("sync").await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(10), ctl.acquire("sync")).await;
        assert!(timed_out.is_err());

        // A slot is free once the limit is raised; the dead entry must not block it
        ctl.update_limits("sync", 2);
        let newcomer = tokio::time::timeout(Duration::from_millis(10), ctl.acquire("sync")).await;
        assert!(newcomer.is_ok(), "newcomer waited behind a cancelled waiter");
        let status = &ctl.get_status()["sync"];
        assert_eq!((status.current_running, status.queue_depth), (2, 0));
        drop(holder);
    }

    #[tokio::test]
    async fn test_waiter_aborted_after_grant_returns_slot() {
        let ctl = controller("sync", 1);
        let holder = ctl.acquire("sync").await.unwrap();
        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                let _permit = ctl.acquire("sync").await;
                std::future::pending::<()>().await;
            })
        };
        settle().await;

        // Slot is handed to the waiter, which is cancelled before it runs
        drop(holder);
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(ctl.get_status()["sync"].current_running, 0);
    }

    #[tokio::test]
    async fn test_update_limits() {
        let ctl = controller("email", 1);
        let a = ctl.acquire("email").await.unwrap();
        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.acquire("email").await })
        };
        settle().await;

        // Raising the limit does not wake the queue by itself
        ctl.update_limits("email", 2);
        settle().await;
        assert!(!waiter.is_finished());

        drop(a);
        let b = waiter.await.unwrap().unwrap();
        assert_eq!(ctl.get_status()["email"].max_concurrent, 2);
        drop(b);

        ctl.update_limits("pdf", 4);
        assert_eq!(ctl.get_status()["pdf"].max_concurrent, 4);
        assert!(!ctl.acquire("pdf").await.unwrap().is_unbounded());
    }
}
