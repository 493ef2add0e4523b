use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Instant,
};

use anyhow::{bail, Context as _};
use futures::future::join_all;
use maplit::hashmap;
use tokio_util::sync::CancellationToken;

use super::{lock, run::Prepared, Access, FileSlot, Scheduler, Scope};
use crate::compile::BuildKind;
use crate::error::RunError;
use crate::runner::{Limits, RunReport, RunSpec};
use crate::str_interp::{interp_args, InterpError};
use crate::testing::{CaseFile, CaseId, StressStatus, TestCase, TestResult, Verdict};

const INPUT: &str = "input.txt";
const ANSWER: &str = "answer.txt";
const OUTPUT: &str = "output.txt";

/// Expands a generator argument template for one iteration.
pub(super) fn generator_args(template: &str, index: u32, seed: u64) -> Result<Vec<String>, InterpError> {
    let vars = hashmap! {
        "index" => index.to_string(),
        "seed" => seed.to_string(),
    };
    interp_args(template, &vars)
}

enum Halt {
    /// The candidate disagreed with the brute force.
    Failed {
        index: u32,
        dir: PathBuf,
        report: RunReport,
    },
    Fatal(anyhow::Error),
}

struct StressRun<'a> {
    id: CaseId,
    prepared: &'a Prepared,
    generator: PathBuf,
    brute: PathBuf,
    args: String,
    count: u32,
    /// Child of the case token; tripped by the first halt.
    stop: CancellationToken,
    next: AtomicU32,
    completed: AtomicU32,
    started: Instant,
    halt: Mutex<Option<Halt>>,
}

impl StressRun<'_> {
    fn halt(&self, halt: Halt) {
        let mut slot = lock(&self.halt);
        if slot.is_none() {
            *slot = Some(halt);
        }
        self.stop.cancel();
    }
}

impl Scheduler {
    /// Generates inputs, runs the brute force and the program on each, and
    /// stops at the first disagreement. The failing input and the expected
    /// output become the case's input and answer.
    pub async fn stress(&self, id: CaseId) -> anyhow::Result<Option<TestResult>> {
        let lease = self.acquire(Scope::Case(id), Access::Cancellable, None)?;
        let cancel = lease.token();
        self.modify_case(id, TestCase::clear_outcome)?;

        let outcome = self.stress_leased(id, &cancel).await;
        let _ = self.modify_case(id, |c| {
            if let Some(stress) = c.stress.as_mut() {
                stress.status = None;
            }
        });
        self.settle(id, "stress test", outcome, true)
    }

    async fn stress_leased(
        &self,
        id: CaseId,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<RunReport>> {
        let stress = self
            .case(id)
            .and_then(|c| c.stress)
            .context("No stress settings; set a generator and a brute force first")?;
        if stress.count == 0 {
            bail!("Stress iteration count must be positive");
        }
        // reject bad templates before compiling anything
        generator_args(&stress.args, 0, 0)?;

        let Some(prepared) = self.prepare(BuildKind::Fast, cancel).await? else {
            return Ok(None);
        };
        if prepared.interactor.is_some() {
            bail!("Stress testing does not support interactive problems");
        }
        let (generator, brute) = tokio::try_join!(
            self.compile(&stress.generator, BuildKind::Fast, cancel),
            self.compile(&stress.brute, BuildKind::Fast, cancel),
        )?;
        let (Some(generator), Some(brute)) = (generator, brute) else {
            return Ok(None);
        };

        let run = StressRun {
            id,
            prepared: &prepared,
            generator,
            brute,
            args: stress.args.clone(),
            count: stress.count,
            stop: cancel.child_token(),
            next: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            started: Instant::now(),
            halt: Mutex::new(None),
        };
        self.set_stress_status(&run, 0);
        log::info!("Stress testing #{} with {} iteration(s)", id, stress.count);

        let root = self.inner.settings.work_dir.join(format!("stress-{}", id));
        let workers = self.inner.settings.concurrency.min(stress.count as usize).max(1);
        join_all((0..workers).map(|k| self.stress_worker(&run, root.join(format!("w{}", k))))).await;

        let halt = run.halt.into_inner().unwrap_or_else(|p| p.into_inner());
        match halt {
            Some(Halt::Fatal(e)) => Err(e),
            Some(Halt::Failed { index, dir, report }) => {
                self.freeze(id, &dir)?;
                let message = format!(
                    "Stress test of #{} failed at iteration {}: {}",
                    id, index, report.result.verdict
                );
                log::info!("{}", message);
                self.notice(message);
                Ok(Some(report))
            }
            None if cancel.is_cancelled() => Ok(None),
            None => {
                let mut result = TestResult::new(Verdict::AC);
                result.time_ms = Some(run.started.elapsed().as_millis() as u64);
                Ok(Some(RunReport {
                    result,
                    stdout: Default::default(),
                    stderr: Default::default(),
                    judge: format!("{} iteration(s) passed", stress.count),
                }))
            }
        }
    }

    async fn stress_worker(&self, run: &StressRun<'_>, dir: PathBuf) {
        if let Err(e) = fsutil::reset_dir(&dir) {
            run.halt(Halt::Fatal(e.into()));
            return;
        }
        loop {
            if run.stop.is_cancelled() {
                return;
            }
            let index = run.next.fetch_add(1, Ordering::SeqCst);
            if index >= run.count {
                return;
            }
            match self.stress_iteration(run, &dir, index).await {
                Ok(None) => return,
                Ok(Some(report)) if report.result.verdict.is_accepted() => {
                    let done = run.completed.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_stress_status(run, done);
                }
                Ok(Some(report)) => {
                    run.halt(Halt::Failed {
                        index,
                        dir: dir.clone(),
                        report,
                    });
                    return;
                }
                Err(e) => {
                    run.halt(Halt::Fatal(e));
                    return;
                }
            }
        }
    }

    async fn stress_iteration(
        &self,
        run: &StressRun<'_>,
        dir: &Path,
        index: u32,
    ) -> anyhow::Result<Option<RunReport>> {
        let input = dir.join(INPUT);
        let answer = dir.join(ANSWER);
        let limits = Limits::from_run_config(&run.prepared.run_config);

        let spec = RunSpec::new(&run.generator, &input, run.stop.clone())
            .args(generator_args(&run.args, index, rand::random())?)
            .limits(limits);
        let Some(gen) = self.inner.runner.run(spec).await? else {
            return Ok(None);
        };
        if !gen.result.verdict.is_accepted() {
            return Err(RunError::new(
                format!(
                    "Generator failed on iteration {} ({}): {}",
                    index,
                    gen.result.verdict,
                    gen.stderr.text.trim_end()
                ),
                &run.generator,
            )
            .into());
        }

        let spec = RunSpec::new(&run.brute, &answer, run.stop.clone())
            .stdin(&input)
            .limits(limits);
        let Some(brute) = self.inner.runner.run(spec).await? else {
            return Ok(None);
        };
        if !brute.result.verdict.is_accepted() {
            return Err(RunError::new(
                format!(
                    "Brute force failed on iteration {} ({}): {}",
                    index,
                    brute.result.verdict,
                    brute.stderr.text.trim_end()
                ),
                &run.brute,
            )
            .into());
        }

        let mut spec = RunSpec::new(&run.prepared.program, dir.join(OUTPUT), run.stop.clone())
            .stdin(&input)
            .judge(run.prepared.judge.clone(), &answer)
            .limits(limits)
            .observer(self.observer(run.id));
        if let Some(fio) = &run.prepared.run_config.file_io {
            spec = spec.file_io(fio.clone(), dir.join("fio"));
        }
        Ok(self.inner.runner.run(spec).await?)
    }

    fn set_stress_status(&self, run: &StressRun<'_>, current: u32) {
        let status = StressStatus {
            current,
            elapsed_ms: run.started.elapsed().as_millis() as u64,
            total: run.count,
        };
        let _ = self.modify_case(run.id, |c| {
            if let Some(stress) = c.stress.as_mut() {
                stress.status = Some(status);
            }
        });
    }

    /// Copies the failing iteration's files into the case.
    fn freeze(&self, id: CaseId, dir: &Path) -> anyhow::Result<()> {
        for (slot, name) in [(FileSlot::Input, INPUT), (FileSlot::Answer, ANSWER)] {
            let path = self.owned_path(id, slot);
            fsutil::copy_file_with_mkdir(dir.join(name), &path)?;
            self.replace_file(id, slot, Some(CaseFile::owned(path)))?;
        }
        Ok(())
    }
}
