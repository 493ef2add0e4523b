use std::{collections::VecDeque, sync::Mutex};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::{lock, run::Prepared, Access, Scheduler, Scope};
use crate::compile::BuildKind;
use crate::error::{CaseError, CompileError};
use crate::event::RunState;
use crate::testing::{Aggregate, CaseId, TestCase, TestResult};

impl Scheduler {
    /// Runs every case with a bounded number of workers, compiling once.
    /// Returns the aggregate result, or `Ok(None)` if cancelled.
    pub async fn run_all(&self) -> anyhow::Result<Option<TestResult>> {
        let lease = self.acquire(Scope::Batch, Access::Cancellable, None)?;
        let cancel = lease.token();
        let ids: Vec<CaseId> = self.state().slots.iter().map(|s| s.case.id).collect();
        let total = ids.len();
        self.update_run_state(|s| *s = RunState::started(total));
        log::info!("Running {} test case(s)", total);

        let prepared = match self.prepare(BuildKind::Fast, &cancel).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.update_run_state(|s| s.running = false);
                return Ok(None);
            }
            Err(e) => {
                let e = e.context("Failed to run all test cases");
                log::error!("{:#}", e);
                self.notice(format!("{:#}", e));
                let err = match e.downcast_ref::<CompileError>() {
                    Some(ce) => CaseError::from(ce),
                    None => CaseError::internal(&e),
                };
                self.update_run_state(|s| {
                    s.running = false;
                    s.err = Some(err);
                });
                return Err(e);
            }
        };

        let queue = Mutex::new(ids.into_iter().collect::<VecDeque<_>>());
        let aggregate = Mutex::new(Aggregate::default());
        let workers = self.inner.settings.concurrency.min(total).max(1);
        join_all((0..workers).map(|_| self.batch_worker(&queue, &aggregate, &prepared, &cancel))).await;

        if cancel.is_cancelled() {
            log::info!("Run all cancelled");
            self.update_run_state(|s| s.running = false);
            return Ok(None);
        }
        let result = lock(&aggregate).to_result();
        log::info!("Run all finished: {}", result.verdict);
        let r = result.clone();
        self.update_run_state(move |s| {
            s.running = false;
            s.result = Some(r);
        });
        Ok(Some(result))
    }

    async fn batch_worker(
        &self,
        queue: &Mutex<VecDeque<CaseId>>,
        aggregate: &Mutex<Aggregate>,
        prepared: &Prepared,
        cancel: &CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let next = lock(queue).pop_front();
            let Some(id) = next else {
                return;
            };
            if let Some(result) = self.run_batch_case(id, prepared, cancel).await {
                lock(aggregate).push(&result);
            }
            self.update_run_state(|s| s.done += 1);
        }
    }

    async fn run_batch_case(
        &self,
        id: CaseId,
        prepared: &Prepared,
        batch: &CancellationToken,
    ) -> Option<TestResult> {
        if self.case(id).is_none() {
            log::debug!("Test case #{} was removed, skipping", id);
            return None;
        }
        let lease = match self.acquire(Scope::Case(id), Access::Cancellable, Some(batch)) {
            Ok(lease) => lease,
            Err(e) => {
                log::warn!("Skipping test case #{}: {:#}", id, e);
                return None;
            }
        };
        self.modify_case(id, TestCase::clear_outcome).ok()?;
        let outcome = self.execute(id, prepared, lease.token(), None, None).await;
        // failures stay on the case and never stop the batch
        self.settle(id, "run", outcome, true).ok().flatten()
    }
}
