//! What the engine tells its consumers (UI, persistence, the CLI).

use serde::{Deserialize, Serialize};

pub use crate::runner::Channel;
use crate::error::CaseError;
use crate::runner::Captured;
use crate::testing::{CaseId, TestCase, TestResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    CaseAdded {
        case: TestCase,
    },
    CaseChanged {
        case: TestCase,
    },
    CaseRemoved {
        id: CaseId,
    },
    RunState {
        state: RunState,
    },
    /// A chunk streamed while a program runs.
    Output {
        id: CaseId,
        channel: Channel,
        data: String,
    },
    OutputReady {
        id: CaseId,
        stdout: Captured,
        stderr: Captured,
        judge: String,
    },
    /// One-line message meant for the user.
    Notice {
        message: String,
    },
}

/// Progress and outcome of "run all".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub running: bool,
    pub done: usize,
    pub total: usize,
    pub result: Option<TestResult>,
    pub err: Option<CaseError>,
}

impl RunState {
    pub fn started(total: usize) -> Self {
        Self {
            running: true,
            total,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let e = Event::CaseRemoved { id: 3 };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["event"], "caseRemoved");
        assert_eq!(json["id"], 3);

        let e = Event::Output {
            id: 1,
            channel: Channel::Interaction,
            data: "5\n".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["channel"], "interaction");
    }
}
