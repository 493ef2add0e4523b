use std::collections::HashMap;

use colored::{Color, ColoredString, Colorize};
use crossterm::terminal;

use crate::runner::Captured;
use crate::testing::{TestCase, TestResult, Verdict};

#[macro_export]
macro_rules! print_success {
    ($fmt:literal, $($e:tt)*) => {
        use ::colored::Colorize as _;
        println!("{}", format!($fmt, $($e)*).green())
    }
}

pub fn is_truecolor_supported() -> bool {
    let Ok(v) = std::env::var("COLORTERM") else {
        return false
    };
    matches!(v.as_str(), "truecolor" | "24bit")
}

pub trait ColorTheme {
    fn color(&self) -> Color;
}

impl ColorTheme for log::Level {
    fn color(&self) -> Color {
        use log::Level::*;
        match self {
            Error => Color::BrightRed,
            Warn => Color::BrightYellow,
            Info => Color::Cyan,
            Debug => Color::Magenta,
            Trace => Color::Blue,
        }
    }
}

impl ColorTheme for Verdict {
    fn color(&self) -> Color {
        use Verdict::*;
        if !self::is_truecolor_supported() {
            return match self {
                AC => Color::Green,
                WA => Color::Yellow,
                TL | ML => Color::Red,
                RE => Color::Magenta,
                CE => Color::Blue,
                INT => Color::White,
            };
        }

        let (r, g, b) = match self {
            AC => (30, 180, 40),
            WA => (210, 138, 4),
            TL => (220, 42, 42),
            ML => (200, 70, 30),
            RE => (171, 40, 200),
            CE => (50, 90, 210),
            INT => (120, 120, 120),
        };
        Color::TrueColor { r, g, b }
    }
}

pub fn verdict_icon(verdict: Verdict) -> ColoredString {
    let fg = if is_truecolor_supported() {
        Color::TrueColor {
            r: 255,
            g: 255,
            b: 255,
        }
    } else {
        Color::BrightBlack
    };
    format!(" {} ", verdict)
        .on_color(verdict.color())
        .bold()
        .color(fg)
}

/// `[12ms, 3.4MB]`, omitting whatever was not measured.
pub fn usage_label(r: &TestResult) -> String {
    let mut parts = Vec::new();
    if let Some(ms) = r.time_ms {
        parts.push(format!("{}ms", ms));
    }
    if let Some(mb) = r.memory_mb {
        parts.push(format!("{:.1}MB", mb));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("[{}]", parts.join(", "))
    }
}

pub fn print_case_line(case: &TestCase) {
    let verdict = match &case.result {
        Some(r) => format!("{} {}", verdict_icon(r.verdict), usage_label(r).dimmed()),
        None => "-".dimmed().to_string(),
    };
    println!("{:>4}  {:<24} {}", case.id.to_string().bold(), case.name, verdict);
    if let Some(err) = &case.err {
        println!("      {}", err.to_string().bright_red());
    }
}

pub fn print_test_result_summary(results: &[TestResult]) {
    let bar = "-".repeat(5);
    print!("{} ", bar);

    let count: HashMap<Verdict, usize> = results.iter().fold(HashMap::new(), |mut count, r| {
        *count.entry(r.verdict).or_default() += 1;
        count
    });

    let num_total_test = results.len();
    let num_passed = *count.get(&Verdict::AC).unwrap_or(&0);
    let num_failed = num_total_test - num_passed;

    if num_passed == num_total_test {
        let msg = format!("All {} tests passed ✨", num_total_test);
        print!("{}", msg.green());
    } else {
        let summary_msg = if num_passed > 0 {
            format!("{}/{} tests failed 💣", num_failed, num_total_test)
        } else {
            format!("All {} tests failed 💀", num_total_test)
        };

        let mut failed: Vec<_> = count.iter().filter(|(&v, _)| v != Verdict::AC).collect();
        failed.sort_by_key(|(&v, _)| v.to_string());
        let detail_msg = failed
            .into_iter()
            .map(|(&verdict, &cnt)| {
                format!(
                    "{}{}{}",
                    self::verdict_icon(verdict),
                    "x".dimmed(),
                    cnt.to_string().bold().bright_white(),
                )
            })
            .collect::<Vec<String>>()
            .join(", ");

        print!("{} ({})", summary_msg.bright_red(), detail_msg);
    }

    println!(" {}", bar);
}

/// Everything shown for one finished run.
pub struct Detail<'a> {
    pub title: &'a str,
    pub result: &'a TestResult,
    pub answer: Option<&'a str>,
    pub stdout: &'a Captured,
    pub stderr: &'a Captured,
    pub judge: &'a str,
}

pub fn print_test_result_detail(d: &Detail) {
    let (cols, _) = terminal::size().unwrap_or((40, 40));
    let cols = (cols as usize).max(20);

    const BOLD_LINE: &str = "━";
    const THIN_LINE: &str = "─";

    let bold_bar = BOLD_LINE.repeat(cols).blue().bold();

    let title_color = Color::BrightYellow;
    println!(
        "\n{}: {} {}\n{}",
        d.title.color(title_color).bold(),
        self::verdict_icon(d.result.verdict),
        usage_label(d.result),
        bold_bar,
    );

    fn print_sub_title(s: &str, cols: usize) {
        println!(
            "{}{}",
            s.cyan().bold(),
            THIN_LINE.repeat(cols.saturating_sub(s.len() + 1)).bright_black(),
        )
    }

    fn print_lines(entire_str: &str) {
        let lines: Vec<_> = entire_str.lines().collect();
        if lines.is_empty() {
            println!("{}", "<EMPTY>".magenta().dimmed());
            return;
        }
        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim_end();
            print!("{}", trimmed);

            let num_trailling_whitespace = line.len() - trimmed.len();
            if num_trailling_whitespace > 0 {
                print!(
                    "{}{}",
                    " ".repeat(num_trailling_whitespace).on_red(),
                    "(Trailling whitespace)".bright_red().bold()
                );
            }

            let is_last_line = i + 1 == lines.len();
            if is_last_line && !entire_str.ends_with('\n') {
                print!("{}", " Missing new line ".on_yellow().black().bold());
            }

            println!();
        }
    }

    fn print_hidden(c: &Captured) {
        if c.is_truncated() {
            println!("{}", format!("... {} more bytes", c.hidden_bytes).dimmed());
        }
    }

    if let Some(answer) = d.answer {
        print_sub_title("[answer]", cols);
        print_lines(answer);
    }

    print_sub_title("[stdout]", cols);
    print_lines(&d.stdout.text);
    print_hidden(d.stdout);

    if !d.stderr.text.is_empty() {
        print_sub_title("[stderr]", cols);
        print!("{}", d.stderr.text);
        print_hidden(d.stderr);
    }

    if !d.judge.is_empty() {
        print_sub_title("[judge]", cols);
        println!("{}", d.judge.trim_end());
    }

    println!("{}", bold_bar);
}
