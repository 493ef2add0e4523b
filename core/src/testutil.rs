//! Fixtures shared by unit tests: shell-script "programs" and a fake
//! toolchain that copies the source to the output and logs each call.

use std::path::{Path, PathBuf};

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fsutil::write_with_mkdir(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fsutil::set_executable(&path).unwrap();
    path
}

pub fn fake_toolchain(dir: &Path) -> (PathBuf, PathBuf) {
    slow_fake_toolchain(dir, 0.0)
}

pub fn slow_fake_toolchain(dir: &Path, delay_secs: f64) -> (PathBuf, PathBuf) {
    let log = dir.join("toolchain.log");
    let body = format!(
        r#"if [ "$1" = "--version" ]; then echo "fakecc 1.0"; exit 0; fi
echo "$@" >> '{log}'
sleep {delay}
if grep -q COMPILE_ERROR "$1"; then echo "$1:2: syntax error" >&2; exit 1; fi
cp "$1" "$3" && chmod +x "$3""#,
        log = log.to_string_lossy(),
        delay = delay_secs,
    );
    (write_script(dir, "fakecc", &body), log)
}

pub fn invocations(log: &Path) -> usize {
    fsutil::read_to_string(log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
