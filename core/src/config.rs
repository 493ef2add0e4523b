use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::time::Duration;

use anyhow::Context as _;
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};

use crate::checker::Checker;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub source_config_file: Option<PathBuf>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub toolchain: Vec<ToolchainConfig>,
    #[serde(default)]
    pub debugger: Option<DebuggerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub work_dir: PathBuf,
    pub build_dir: Option<PathBuf>,
    pub cache_limit: usize,
    pub concurrency: usize,
    pub trusted: bool,
    pub compile_timeout_secs: u64,
    pub checker_timeout_secs: u64,
    pub stdout_capture_max_bytes: usize,
    pub stderr_capture_max_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./.cprun/work"),
            build_dir: None,
            cache_limit: 20,
            concurrency: 4,
            trusted: true,
            compile_timeout_secs: 60,
            checker_timeout_secs: 60,
            stdout_capture_max_bytes: 64 * 1024,
            stderr_capture_max_bytes: 16 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn checker_timeout(&self) -> Duration {
        Duration::from_secs(self.checker_timeout_secs)
    }

    /// The configured build dir, or the per-user cache dir.
    pub fn build_dir_or_default(&self) -> PathBuf {
        self.build_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("cprun")
                .join("build")
        })
    }
}

/// Candidate reads/writes these names in its working directory instead of stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIo {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub time_limit_secs: f64,
    pub memory_limit_mb: u64,
    pub disable_time_limit: bool,
    pub eof_on_close: bool,
    pub file_io: Option<FileIo>,
    pub checker: Checker,
    pub interactor: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 2.0,
            memory_limit_mb: 1024,
            disable_time_limit: false,
            eof_on_close: true,
            file_io: None,
            checker: Checker::default(),
            interactor: None,
        }
    }
}

impl RunConfig {
    /// No limit when disabled, non-positive, or not representable (`inf`, `nan`).
    pub fn time_limit(&self) -> Option<Duration> {
        if self.disable_time_limit || self.time_limit_secs <= 0.0 {
            None
        } else {
            Duration::try_from_secs_f64(self.time_limit_secs).ok()
        }
    }

    pub fn memory_limit_mb(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then_some(self.memory_limit_mb)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolchainConfig {
    pub pattern: GlobPattern,
    pub program: String,
    #[serde(default)]
    pub fast_flags: Vec<String>,
    #[serde(default)]
    pub debug_flags: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DebuggerConfig {
    /// `#{pid}` is replaced with the id of the suspended process.
    pub command: String,
    pub ready_marker: String,
    #[serde(default = "DebuggerConfig::default_attach_timeout_secs")]
    pub attach_timeout_secs: u64,
}

impl DebuggerConfig {
    fn default_attach_timeout_secs() -> u64 {
        10
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct GlobPattern(glob::Pattern);

impl GlobPattern {
    pub fn parse(pattern: &str) -> StdResult<Self, glob::PatternError> {
        glob::Pattern::new(pattern).map(Self)
    }

    pub fn matches_file_name(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.0.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    }
}

impl TryFrom<String> for GlobPattern {
    type Error = glob::PatternError;

    fn try_from(s: String) -> StdResult<Self, Self::Error> {
        Self::parse(&s)
    }
}

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Asset;

impl Config {
    pub const FILENAME: &str = "cprun.toml";

    pub fn example_toml() -> String {
        Asset::get(Self::FILENAME)
            .map(|file| String::from_utf8_lossy(file.data.as_ref()).into_owned())
            .unwrap_or_default()
    }

    pub fn from_toml(s: &str) -> StdResult<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(filepath: PathBuf) -> anyhow::Result<Self> {
        let toml = fsutil::read_to_string(&filepath).context("Cannot read a file")?;
        let mut cfg = Self::from_toml(&toml)
            .with_context(|| format!("Invalid config TOML: {:?}", filepath))?;
        if let Some(base) = filepath.parent() {
            cfg.resolve_relative_paths(base);
        }
        cfg.source_config_file = Some(filepath);
        Ok(cfg)
    }

    /// Find config file ancestor dirs, including current dir.
    pub fn find_file_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let cur_dir = cur_dir.as_ref();
        cur_dir
            .ancestors()
            .map(|dir| dir.join(Self::FILENAME))
            .find(|path| path.is_file())
            .with_context(|| {
                format!(
                    "Not in a cprun project dir: Cannot find '{}'",
                    Self::FILENAME
                )
            })
    }

    pub fn from_file_finding_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_filepath = Config::find_file_in_ancestors(cur_dir)?;
        Self::from_toml_file(config_filepath)
    }

    /// Directory holding the config file; everything project-local lives below it.
    pub fn project_dir(&self) -> PathBuf {
        self.source_config_file
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.engine.work_dir);
        if let Some(dir) = self.engine.build_dir.as_mut() {
            resolve(dir);
        }
        if let Checker::External(p) = &mut self.run.checker {
            resolve(p);
        }
        if let Some(p) = self.run.interactor.as_mut() {
            resolve(p);
        }
        for t in &mut self.toolchain {
            t.include_dirs.iter_mut().for_each(resolve);
        }
    }

    pub fn find_toolchain(&self, source: &Path) -> Option<&ToolchainConfig> {
        self.toolchain
            .iter()
            .find(|t| t.pattern.matches_file_name(source))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn example_toml_should_be_parsable() {
        let toml = Config::example_toml();
        let cfg = dbg!(Config::from_toml(&toml)).unwrap();

        assert_eq!(cfg.source_config_file, None);
        assert_eq!(cfg.engine.cache_limit, 20);
        assert_eq!(cfg.engine.concurrency, 4);
        assert_eq!(cfg.engine.compile_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.run.checker, Checker::Tokens);
        assert_eq!(cfg.run.time_limit(), Some(Duration::from_secs(2)));
        assert_eq!(cfg.toolchain.len(), 2);
        assert_eq!(cfg.toolchain[0].program, "g++");

        let debugger = cfg.debugger.unwrap();
        assert!(debugger.command.contains("#{pid}"));
        assert_eq!(debugger.attach_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.engine, EngineConfig::default());
        assert_eq!(cfg.run, RunConfig::default());
        assert!(cfg.toolchain.is_empty());
        assert!(cfg.debugger.is_none());
    }

    #[test]
    fn disabled_time_limit_is_none() {
        let run = RunConfig {
            disable_time_limit: true,
            ..Default::default()
        };
        assert_eq!(run.time_limit(), None);
    }

    #[test]
    fn unrepresentable_time_limit_is_none() {
        for value in ["inf", "nan", "-inf", "1e300"] {
            let cfg = Config::from_toml(&format!("[run]\ntime_limit_secs = {}\n", value)).unwrap();
            assert_eq!(cfg.run.time_limit(), None, "{}", value);
        }
        let cfg = Config::from_toml("[run]\ntime_limit_secs = 0.5\n").unwrap();
        assert_eq!(cfg.run.time_limit(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn toolchain_matches_by_file_name() {
        let cfg = Config::from_toml(&Config::example_toml()).unwrap();
        let t = cfg.find_toolchain(Path::new("/work/a/main.cpp")).unwrap();
        assert_eq!(t.program, "g++");
        assert_eq!(cfg.find_toolchain(Path::new("x.c")).unwrap().program, "gcc");
        assert!(cfg.find_toolchain(Path::new("main.py")).is_none());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(Config::FILENAME);
        fsutil::write(
            &path,
            "[engine]\nwork_dir = \"w\"\n[run]\ninteractor = \"inter.cpp\"\n",
        )
        .unwrap();
        let cfg = Config::from_toml_file(path).unwrap();
        assert_eq!(cfg.engine.work_dir, dir.path().join("w"));
        assert_eq!(cfg.run.interactor, Some(dir.path().join("inter.cpp")));
        assert_eq!(cfg.project_dir(), dir.path());
    }
}
