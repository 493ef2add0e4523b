use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which program decides whether an output matches the answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checker {
    /// Whitespace-insensitive token comparison.
    #[default]
    Tokens,
    /// Byte-for-byte comparison.
    Exact,
    /// A user checker source, compiled and invoked as `checker input output answer`.
    External(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub ok: bool,
    pub message: String,
}

impl CheckOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn wrong(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

fn shorten(token: &[u8]) -> String {
    const MAX: usize = 64;
    let s = String::from_utf8_lossy(token);
    if s.chars().count() <= MAX {
        s.into_owned()
    } else {
        let head: String = s.chars().take(MAX).collect();
        format!("{}...", head)
    }
}

pub fn check_tokens(output: &[u8], answer: &[u8]) -> CheckOutcome {
    let mut out = output.split(u8::is_ascii_whitespace).filter(|t| !t.is_empty());
    let mut ans = answer.split(u8::is_ascii_whitespace).filter(|t| !t.is_empty());
    let mut n = 0usize;

    loop {
        match (ans.next(), out.next()) {
            (None, None) => return CheckOutcome::ok(format!("ok {} token(s)", n)),
            (Some(a), Some(o)) if a == o => n += 1,
            (Some(a), Some(o)) => {
                return CheckOutcome::wrong(format!(
                    "wrong answer {} token differs - expected: '{}', found: '{}'",
                    ordinal(n + 1),
                    shorten(a),
                    shorten(o)
                ))
            }
            (Some(a), None) => {
                return CheckOutcome::wrong(format!(
                    "wrong answer Answer contains longer sequence [length = {}+], but output contains {} elements (next expected: '{}')",
                    n + 1,
                    n,
                    shorten(a)
                ))
            }
            (None, Some(o)) => {
                return CheckOutcome::wrong(format!(
                    "wrong answer Output contains longer sequence [length = {}+], but answer contains {} elements (extra: '{}')",
                    n + 1,
                    n,
                    shorten(o)
                ))
            }
        }
    }
}

pub fn check_exact(output: &[u8], answer: &[u8]) -> CheckOutcome {
    if output == answer {
        return CheckOutcome::ok(format!("ok {} byte(s)", output.len()));
    }
    let pos = output
        .iter()
        .zip(answer)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| output.len().min(answer.len()));
    let line = output[..pos].iter().filter(|&&b| b == b'\n').count() + 1;
    CheckOutcome::wrong(format!(
        "wrong answer outputs differ at byte {} (line {}), output {} byte(s), answer {} byte(s)",
        pos + 1,
        line,
        output.len(),
        answer.len()
    ))
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}
