use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::testing::{CaseId, TestCase};

/// Persisted state of one test set: the cases in display order and the
/// settings shared by all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSetRecord {
    #[serde(default)]
    pub cases: Vec<TestCase>,
    #[serde(default = "TestSetRecord::first_id")]
    pub next_id: CaseId,
    #[serde(default)]
    pub run_config: RunConfig,
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Local>>,
}

impl Default for TestSetRecord {
    fn default() -> Self {
        Self {
            cases: Vec::new(),
            next_id: Self::first_id(),
            run_config: RunConfig::default(),
            program: None,
            updated_at: None,
        }
    }
}

impl TestSetRecord {
    pub const FILENAME: &str = "testset.json";

    fn first_id() -> CaseId {
        1
    }

    /// A missing or unreadable record is an empty test set.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fsutil::read_json_with_deserialize::<_, Self>(path) {
            Ok(mut record) => {
                record.fix_next_id();
                record
            }
            Err(e) if e.is_not_found() => Self::default(),
            Err(e) => {
                log::warn!("Ignoring broken test set: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&mut self, path: impl AsRef<Path>) -> fsutil::Result<()> {
        self.updated_at = Some(Local::now());
        fsutil::write_json_with_mkdir(path, self)
    }

    /// Ids are never reused, even if the counter on disk went backwards.
    fn fix_next_id(&mut self) {
        let max = self.cases.iter().map(|c| c.id).max().unwrap_or(0);
        self.next_id = self.next_id.max(max + 1);
    }
}
