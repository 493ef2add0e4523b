mod cache;

pub use cache::CacheLedger;

use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use self::cache::ArtifactCache;
use crate::config::{Config, ToolchainConfig};
use crate::error::CompileError;

/// `Ok(None)` means the compilation was cancelled.
pub type CompileOutcome = Result<Option<PathBuf>, CompileError>;

type SharedCompile = Shared<BoxFuture<'static, CompileOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BuildKind {
    Fast,
    Debug,
}

#[derive(Debug, Clone)]
pub struct CompilerSettings {
    pub build_dir: PathBuf,
    pub cache_limit: usize,
    pub timeout: Duration,
    pub trusted: bool,
    pub toolchains: Vec<ToolchainConfig>,
}

impl CompilerSettings {
    pub const DEFAULT_CACHE_LIMIT: usize = 20;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            cache_limit: Self::DEFAULT_CACHE_LIMIT,
            timeout: Self::DEFAULT_TIMEOUT,
            trusted: true,
            toolchains: Vec::new(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            build_dir: cfg.engine.build_dir_or_default(),
            cache_limit: cfg.engine.cache_limit,
            timeout: cfg.engine.compile_timeout(),
            trusted: cfg.engine.trusted,
            toolchains: cfg.toolchain.clone(),
        }
    }

    pub fn toolchain(mut self, t: ToolchainConfig) -> Self {
        self.toolchains.push(t);
        self
    }
}

/// Content-addressed compiler front end. Cheap to clone; clones share the
/// cache and the in-flight table.
#[derive(Debug, Clone)]
pub struct Compiler {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    timeout: Duration,
    trusted: bool,
    toolchains: Vec<ToolchainConfig>,
    state: Mutex<State>,
    identities: Mutex<HashMap<String, String>>,
}

struct State {
    cache: ArtifactCache,
    inflight: HashMap<String, SharedCompile>,
    /// Latest non-cacheable artifact per source; the previous one is removed.
    scratch: HashMap<PathBuf, PathBuf>,
}

impl State {
    fn remove_scratch(&mut self) {
        for (_, path) in self.scratch.drain() {
            if let Err(e) = fsutil::remove_file_if_exists(&path) {
                log::warn!("{:#}", e);
            }
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("State")
            .field("cache", &self.cache)
            .field("inflight", &self.inflight.keys().collect::<Vec<_>>())
            .field("scratch", &self.scratch.len())
            .finish()
    }
}

impl ToolchainConfig {
    fn flags(&self, kind: BuildKind, extra_include_dirs: &[PathBuf]) -> Vec<OsString> {
        let base = match kind {
            BuildKind::Fast => &self.fast_flags,
            BuildKind::Debug => &self.debug_flags,
        };
        let mut flags: Vec<OsString> = base.iter().map(OsString::from).collect();
        for dir in self.include_dirs.iter().chain(extra_include_dirs) {
            let mut f = OsString::from("-I");
            f.push(dir);
            flags.push(f);
        }
        flags
    }
}

fn content_hash(source: &[u8], flags: &[OsString], identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source);
    hasher.update([0u8]);
    for f in flags {
        hasher.update(f.to_string_lossy().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize())
}

impl Compiler {
    pub fn new(settings: CompilerSettings) -> Self {
        let CompilerSettings {
            build_dir,
            cache_limit,
            timeout,
            trusted,
            toolchains,
        } = settings;
        Self {
            inner: Arc::new(Inner {
                timeout,
                trusted,
                toolchains,
                state: Mutex::new(State {
                    cache: ArtifactCache::new(build_dir, cache_limit),
                    inflight: HashMap::new(),
                    scratch: HashMap::new(),
                }),
                identities: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn restore(&self, ledger: CacheLedger) {
        self.state().cache.restore(ledger);
    }

    pub fn ledger(&self) -> CacheLedger {
        self.state().cache.ledger()
    }

    pub fn build_dir(&self) -> PathBuf {
        self.state().cache.dir().to_owned()
    }

    /// The ledger and the directory are coupled: changing the directory
    /// discards (and deletes) everything cached so far.
    pub fn set_build_dir(&self, dir: impl AsRef<Path>) {
        let mut state = self.state();
        state.remove_scratch();
        state.cache.switch_dir(dir.as_ref());
    }

    pub fn clear_cache(&self) {
        let mut state = self.state();
        state.remove_scratch();
        state.cache.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.state().cache.len()
    }

    pub fn find_toolchain(&self, source: &Path) -> Option<&ToolchainConfig> {
        self.inner
            .toolchains
            .iter()
            .find(|t| t.pattern.matches_file_name(source))
    }

    /// Compiles `source` and returns the executable path, or `Ok(None)` if
    /// `cancel` fired first.
    pub async fn compile(
        &self,
        source: &Path,
        cacheable: bool,
        kind: BuildKind,
        extra_include_dirs: &[PathBuf],
        cancel: &CancellationToken,
    ) -> CompileOutcome {
        if !self.inner.trusted {
            return Err(CompileError::new(
                "Workspace is not trusted, refusing to run the toolchain",
                source,
            ));
        }
        let toolchain = self.find_toolchain(source).cloned().ok_or_else(|| {
            CompileError::new(
                format!(
                    "No toolchain configured for '{}' (No entry matched glob in `toolchain[]`)",
                    source.file_name().unwrap_or_default().to_string_lossy()
                ),
                source,
            )
        })?;

        let contents = tokio::fs::read(source)
            .await
            .map_err(|e| CompileError::new(format!("Cannot read source file: {}", e), source))?;
        let identity = self.identity(&toolchain.program, source).await?;
        let flags = toolchain.flags(kind, extra_include_dirs);
        let hash = content_hash(&contents, &flags, &identity);

        if !cacheable {
            let job = {
                let mut state = self.state();
                self.spawn_job(&mut state, source, &toolchain.program, flags, hash, false, cancel)
            };
            return tokio::select! {
                out = job => out,
                _ = cancel.cancelled() => Ok(None),
            };
        }

        loop {
            let job = {
                let mut state = self.state();
                if let Some(path) = state.cache.lookup(&hash) {
                    log::debug!(
                        "Compile cache hit for {} ({})",
                        source.to_string_lossy(),
                        &hash[..12]
                    );
                    return Ok(Some(path));
                }
                match state.inflight.get(&hash).cloned() {
                    Some(job) => {
                        log::debug!("Joining in-flight compilation {}", &hash[..12]);
                        job
                    }
                    None => self.spawn_job(
                        &mut state,
                        source,
                        &toolchain.program,
                        flags.clone(),
                        hash.clone(),
                        true,
                        cancel,
                    ),
                }
            };

            let out = tokio::select! {
                out = job => out,
                _ = cancel.cancelled() => return Ok(None),
            };
            match out {
                // whoever started the job was cancelled, but we were not
                Ok(None) if !cancel.is_cancelled() => continue,
                out => return out,
            }
        }
    }

    /// Starts the toolchain on a background task so that the job outlives
    /// any single waiter. Cacheable jobs are registered as in-flight.
    #[allow(clippy::too_many_arguments)]
    fn spawn_job(
        &self,
        state: &mut State,
        source: &Path,
        program: &str,
        flags: Vec<OsString>,
        hash: String,
        cacheable: bool,
        cancel: &CancellationToken,
    ) -> SharedCompile {
        let dir = state.cache.dir().to_owned();
        let target = if cacheable {
            state.cache.artifact_path(&hash)
        } else {
            dir.join(format!("{}-{:08x}.nocache", hash, rand::random::<u32>()))
        };
        let tmp = dir.join(format!(".tmp-{}-{:08x}", hash, rand::random::<u32>()));

        let compiler = self.clone();
        let source = source.to_owned();
        let program = program.to_owned();
        let cancel = cancel.clone();
        let task_hash = hash.clone();
        let task_source = source.clone();

        let handle = tokio::spawn(async move {
            let out = compiler
                .invoke(&program, &source, &dir, &tmp, &target, &flags, &cancel)
                .await;
            let mut state = compiler.state();
            if cacheable {
                if let Ok(Some(_)) = &out {
                    if state.cache.dir() == dir {
                        state.cache.insert(task_hash.clone());
                    }
                }
                state.inflight.remove(&task_hash);
            } else if let Ok(Some(artifact)) = &out {
                if let Some(old) = state.scratch.insert(source, artifact.clone()) {
                    if let Err(e) = fsutil::remove_file_if_exists(&old) {
                        log::warn!("{:#}", e);
                    }
                }
            }
            out
        });

        let job = async move {
            handle.await.unwrap_or_else(|e| {
                Err(CompileError::new(
                    format!("Compile task failed: {}", e),
                    task_source,
                ))
            })
        }
        .boxed()
        .shared();

        if cacheable {
            state.inflight.insert(hash, job.clone());
        }
        job
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        program: &str,
        source: &Path,
        dir: &Path,
        tmp: &Path,
        target: &Path,
        flags: &[OsString],
        cancel: &CancellationToken,
    ) -> CompileOutcome {
        fsutil::mkdir_all(dir).map_err(|e| CompileError::new(format!("{:#}", e), source))?;

        log::info!("Compiling {}", source.to_string_lossy());
        let child = Command::new(program)
            .arg(source)
            .arg("-o")
            .arg(tmp)
            .args(flags)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CompileError::new(format!("Failed to spawn '{}': {}", program, e), source))?;

        let res = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = fsutil::remove_file_if_exists(tmp);
                return Ok(None);
            }
            res = tokio::time::timeout(self.inner.timeout, child.wait_with_output()) => res,
        };

        let fail = |message: String| {
            let _ = fsutil::remove_file_if_exists(tmp);
            Err(CompileError::new(message, source))
        };

        let output = match res {
            Err(_) => {
                return fail(format!(
                    "Compilation timed out after {}s",
                    self.inner.timeout.as_secs()
                ))
            }
            Ok(Err(e)) => return fail(format!("Failed to communicate with '{}': {}", program, e)),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).into_owned();
            message += &String::from_utf8_lossy(&output.stdout);
            if message.trim().is_empty() {
                message = match output.status.code() {
                    Some(code) => format!("Compiler exited with code {}", code),
                    None => "Compiler was terminated by a signal".to_owned(),
                };
            }
            return fail(message);
        }
        if !tmp.is_file() {
            return fail("Compiler succeeded but produced no output file".to_owned());
        }
        if let Err(e) = std::fs::rename(tmp, target) {
            return fail(format!(
                "Cannot move artifact to '{}': {}",
                target.to_string_lossy(),
                e
            ));
        }
        Ok(Some(target.to_owned()))
    }

    /// Toolchain identity: program name plus its `--version` banner, so a
    /// compiler upgrade invalidates every cache key.
    async fn identity(&self, program: &str, source: &Path) -> Result<String, CompileError> {
        if let Some(id) = self
            .inner
            .identities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(program)
        {
            return Ok(id.clone());
        }

        let output = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(program)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CompileError::new(format!("'{} --version' timed out", program), source))?
        .map_err(|e| {
            CompileError::new(format!("Toolchain '{}' is unavailable: {}", program, e), source)
        })?;

        let id = format!(
            "{}\n{}",
            program,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        self.inner
            .identities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(program.to_owned(), id.clone());
        Ok(id)
    }
}
