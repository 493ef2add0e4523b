use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Verdict {
    AC,
    WA,
    RE,
    TL,
    ML,
    CE,
    INT,
}

impl Verdict {
    /// Severity used when folding many verdicts into one.
    /// Anything outside `ML > TL > RE > WA` ranks with AC.
    fn severity(self) -> u8 {
        use Verdict::*;
        match self {
            ML => 4,
            TL => 3,
            RE => 2,
            WA => 1,
            AC | CE | INT => 0,
        }
    }

    /// Returns whichever of the two verdicts is worse; ties keep `self`.
    pub fn worse(self, other: Verdict) -> Verdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_accepted(self) -> bool {
        self == Verdict::AC
    }

    pub fn description(self) -> &'static str {
        use Verdict::*;
        match self {
            AC => "Accepted",
            WA => "Wrong Answer",
            RE => "Runtime Error",
            TL => "Time Limit Exceeded",
            ML => "Memory Limit Exceeded",
            CE => "Compile Error",
            INT => "Interrupted",
        }
    }
}

/// Outcome of one finished run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub verdict: Verdict,
    pub time_ms: Option<u64>,
    pub cpu_ms: Option<u64>,
    pub memory_mb: Option<f64>,
    pub exit_code: Option<i32>,
}

impl TestResult {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            time_ms: None,
            cpu_ms: None,
            memory_mb: None,
            exit_code: None,
        }
    }

    pub fn compile_error() -> Self {
        Self::new(Verdict::CE)
    }
}

/// Per-metric maxima over several results, plus the worst verdict seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub verdict: Option<Verdict>,
    pub time_ms: Option<u64>,
    pub cpu_ms: Option<u64>,
    pub memory_mb: Option<f64>,
}

impl Aggregate {
    pub fn push(&mut self, r: &TestResult) {
        self.verdict = Some(match self.verdict {
            Some(v) => v.worse(r.verdict),
            None => r.verdict,
        });
        self.time_ms = max_opt(self.time_ms, r.time_ms);
        self.cpu_ms = max_opt(self.cpu_ms, r.cpu_ms);
        self.memory_mb = match (self.memory_mb, r.memory_mb) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn to_result(&self) -> TestResult {
        TestResult {
            verdict: self.verdict.unwrap_or(Verdict::AC),
            time_ms: self.time_ms,
            cpu_ms: self.cpu_ms,
            memory_mb: self.memory_mb,
            exit_code: None,
        }
    }
}

fn max_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
