use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::result::TestResult;
use crate::error::CaseError;

pub type CaseId = u32;

/// A file attached to a test case. Owned files are scratch files created by
/// the engine and are deleted together with the case (or when replaced).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFile {
    pub path: PathBuf,
    #[serde(default)]
    pub owned: bool,
}

impl CaseFile {
    pub fn owned(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: true,
        }
    }

    pub fn provided(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CaseState {
    #[default]
    Idle,
    Busy,
    Running,
}

/// Parameters of a stress run: generate, run the brute force, compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stress {
    pub generator: PathBuf,
    pub brute: PathBuf,
    /// Generator argument template; `#{index}` and `#{seed}` are substituted.
    #[serde(default = "Stress::default_args")]
    pub args: String,
    pub count: u32,
    #[serde(skip)]
    pub status: Option<StressStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressStatus {
    pub current: u32,
    pub elapsed_ms: u64,
    pub total: u32,
}

impl Stress {
    pub const DEFAULT_ARGS: &str = "#{index} #{seed}";

    fn default_args() -> String {
        Self::DEFAULT_ARGS.to_owned()
    }

    pub fn new(generator: impl Into<PathBuf>, brute: impl Into<PathBuf>, count: u32) -> Self {
        Self {
            generator: generator.into(),
            brute: brute.into(),
            args: Self::default_args(),
            count,
            status: None,
        }
    }

    pub fn args(mut self, template: impl Into<String>) -> Self {
        self.args = template.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    pub name: String,
    #[serde(default)]
    pub input: Option<CaseFile>,
    #[serde(default)]
    pub answer: Option<CaseFile>,
    #[serde(default)]
    pub result: Option<TestResult>,
    #[serde(default)]
    pub err: Option<CaseError>,
    #[serde(skip)]
    pub state: CaseState,
    #[serde(default)]
    pub stress: Option<Stress>,
}

impl TestCase {
    pub fn new(id: CaseId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            input: None,
            answer: None,
            result: None,
            err: None,
            state: CaseState::Idle,
            stress: None,
        }
    }

    pub fn default_name(id: CaseId) -> String {
        format!("Test #{}", id)
    }

    pub fn label(&self) -> String {
        format!("#{} ({})", self.id, self.name)
    }

    pub fn input_path(&self) -> Option<&Path> {
        self.input.as_ref().map(CaseFile::path)
    }

    pub fn answer_path(&self) -> Option<&Path> {
        self.answer.as_ref().map(CaseFile::path)
    }

    /// Paths of every engine-owned file attached to this case.
    pub fn owned_files(&self) -> impl Iterator<Item = &Path> {
        [&self.input, &self.answer]
            .into_iter()
            .flatten()
            .filter(|f| f.owned)
            .map(CaseFile::path)
    }

    pub fn clear_outcome(&mut self) {
        self.result = None;
        self.err = None;
    }
}
