//! Cross-wiring of a candidate with an interactor: each one's stdout is the
//! other's stdin. The interactor gets `input output` as arguments and its
//! stderr is the judge message.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    pipes::{Captured, Pump, Sink},
    teardown::Teardown,
    Channel, OutputCallback, NULL_INPUT,
};
use crate::error::RunError;
use crate::testing::Verdict;

pub(super) struct Wiring<'a> {
    pub interactor: &'a Path,
    pub input: Option<&'a Path>,
    pub output: PathBuf,
    pub candidate_stdin: ChildStdin,
    pub candidate_stdout: ChildStdout,
    pub out_sink: Option<Sink>,
    pub observer: Option<OutputCallback>,
    pub stdout_max_bytes: usize,
    pub judge_max_bytes: usize,
}

pub(super) struct Interaction {
    interactor: Child,
    path: PathBuf,
    judge: JoinHandle<Captured>,
}

impl Wiring<'_> {
    /// Returns the running interaction and the task capturing what the
    /// candidate printed.
    pub fn start(
        self,
        errors: &mpsc::UnboundedSender<RunError>,
        artifact: &Path,
        teardown: &mut Teardown,
    ) -> Result<(Interaction, JoinHandle<Captured>), RunError> {
        let mut cmd = Command::new(self.interactor);
        cmd.arg(self.input.unwrap_or_else(|| Path::new(NULL_INPUT)))
            .arg(&self.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunError::io("Failed to start interactor", self.interactor, e))?;
        if let Some(pid) = child.id() {
            teardown.kill_group(pid);
        }
        let missing = || RunError::new("Interactor pipes are unavailable", self.interactor);
        let inter_stdin = child.stdin.take().ok_or_else(missing)?;
        let inter_stdout = child.stdout.take().ok_or_else(missing)?;
        let inter_stderr = child.stderr.take().ok_or_else(missing)?;

        let mut to_interactor = vec![Sink::pipe(inter_stdin)];
        to_interactor.extend(self.out_sink);
        let candidate_out = Pump {
            channel: Channel::Stdout,
            max_bytes: self.stdout_max_bytes,
            sinks: to_interactor,
            observer: self.observer.clone(),
        }
        .spawn(self.candidate_stdout, errors.clone(), artifact.to_owned());
        teardown.abort(&candidate_out);

        let to_candidate = Pump {
            channel: Channel::Interaction,
            max_bytes: self.stdout_max_bytes,
            sinks: vec![Sink::pipe(self.candidate_stdin)],
            observer: self.observer.clone(),
        }
        .spawn(inter_stdout, errors.clone(), artifact.to_owned());
        teardown.abort(&to_candidate);

        let judge = Pump {
            channel: Channel::Judge,
            max_bytes: self.judge_max_bytes,
            sinks: Vec::new(),
            observer: self.observer,
        }
        .spawn(inter_stderr, errors.clone(), artifact.to_owned());
        teardown.abort(&judge);

        Ok((
            Interaction {
                interactor: child,
                path: self.interactor.to_owned(),
                judge,
            },
            candidate_out,
        ))
    }
}

impl Interaction {
    /// Waits for the interactor's decision once the candidate exited cleanly.
    /// `Ok(None)` when cancelled.
    pub async fn finish(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<(Verdict, String)>, RunError> {
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            status = tokio::time::timeout(timeout, self.interactor.wait()) => status,
        };
        let status = match status {
            Ok(s) => s.map_err(|e| RunError::io("Failed to wait for interactor", &self.path, e))?,
            Err(_) => {
                return Err(RunError::new(
                    format!(
                        "Interactor did not finish within {}s",
                        timeout.as_secs_f64()
                    ),
                    &self.path,
                ))
            }
        };
        let judge = tokio::time::timeout(super::DRAIN_GRACE, self.judge)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        let verdict = if status.success() {
            Verdict::AC
        } else {
            Verdict::WA
        };
        Ok(Some((verdict, judge.text.trim_end().to_owned())))
    }
}
