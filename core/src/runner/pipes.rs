use std::{io, path::PathBuf};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::ChildStdin,
    sync::mpsc,
    task::JoinHandle,
};

use super::{Channel, LiveInput, OutputCallback};
use crate::error::RunError;

/// Bounded capture of one stream. Bytes past the bound are only counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Captured {
    pub text: String,
    pub hidden_bytes: u64,
}

impl Captured {
    pub fn is_truncated(&self) -> bool {
        self.hidden_bytes > 0
    }
}

/// Where a stream is copied to besides the capture buffer.
pub(super) struct Sink {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    /// A failing required sink is a run error; others are just dropped
    /// (e.g. the peer of a pipe went away).
    required: bool,
}

impl Sink {
    pub fn file(f: tokio::fs::File) -> Self {
        Self {
            writer: Box::new(f),
            required: true,
        }
    }

    pub fn pipe(w: ChildStdin) -> Self {
        Self {
            writer: Box::new(w),
            required: false,
        }
    }
}

pub(super) struct Pump {
    pub channel: Channel,
    pub max_bytes: usize,
    pub sinks: Vec<Sink>,
    pub observer: Option<OutputCallback>,
}

impl Pump {
    /// Copies `reader` until EOF. Errors are reported through `errors`
    /// so they can preempt the run; the task still yields what it captured.
    pub fn spawn<R>(
        self,
        mut reader: R,
        errors: mpsc::UnboundedSender<RunError>,
        artifact: PathBuf,
    ) -> JoinHandle<Captured>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Pump {
            channel,
            max_bytes,
            mut sinks,
            observer,
        } = self;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let mut kept = Vec::new();
            let mut hidden_bytes = 0u64;

            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = errors.send(RunError::io(
                            format!("Failed to read {}", channel),
                            &artifact,
                            e,
                        ));
                        break;
                    }
                };
                let chunk = &buf[..n];
                if let Some(observer) = &observer {
                    observer(channel, chunk);
                }

                let mut i = 0;
                while i < sinks.len() {
                    let written = sinks[i].writer.write_all(chunk).await;
                    match written {
                        Ok(()) => i += 1,
                        Err(e) if sinks[i].required => {
                            let _ = errors.send(RunError::io(
                                format!("Failed to save {}", channel),
                                &artifact,
                                e,
                            ));
                            sinks.remove(i);
                        }
                        Err(e) => {
                            log::debug!("{} peer closed: {}", channel, e);
                            sinks.remove(i);
                        }
                    }
                }

                let room = max_bytes.saturating_sub(kept.len());
                let take = room.min(n);
                kept.extend_from_slice(&chunk[..take]);
                hidden_bytes += (n - take) as u64;
            }

            for sink in &mut sinks {
                let _ = sink.writer.flush().await;
                let _ = sink.writer.shutdown().await;
            }

            Captured {
                text: String::from_utf8_lossy(&kept).into_owned(),
                hidden_bytes,
            }
        })
    }
}

pub(super) struct StdinSource {
    pub file: Option<PathBuf>,
    pub live: Option<LiveInput>,
}

fn is_broken_pipe(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::BrokenPipe
}

/// Feeds the child's stdin: the input file first, then live chunks.
/// A child that stops reading early is fine.
pub(super) fn feed_stdin(
    mut stdin: ChildStdin,
    source: StdinSource,
    observer: Option<OutputCallback>,
    errors: mpsc::UnboundedSender<RunError>,
    artifact: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(path) = source.file {
            let copied = async {
                let mut f = tokio::fs::File::open(&path).await?;
                tokio::io::copy(&mut f, &mut stdin).await?;
                stdin.flush().await
            }
            .await;
            match copied {
                Ok(_) => {}
                Err(e) if is_broken_pipe(&e) => return,
                Err(e) => {
                    let _ = errors.send(RunError::io(
                        format!("Failed to feed input {}", path.to_string_lossy()),
                        &artifact,
                        e,
                    ));
                    return;
                }
            }
        }

        if let Some(LiveInput {
            mut chunks,
            eof_on_close,
        }) = source.live
        {
            while let Some(chunk) = chunks.recv().await {
                if let Some(observer) = &observer {
                    observer(Channel::Input, &chunk);
                }
                let written = async {
                    stdin.write_all(&chunk).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    log::debug!("stdin closed by the program: {}", e);
                    return;
                }
            }
            if !eof_on_close {
                // keep the pipe open until the run is torn down
                std::future::pending::<()>().await;
            }
        }
        drop(stdin);
    })
}
