//! Running a test body in a child process, for behaviour that ends the
//! process (`memtrack::exit` and `memtrack_exit`).
#![allow(dead_code)]

use std::{
    env,
    process::{Command, Output, Stdio},
};

const CHILD_VAR: &str = "MEMTRACK_TEST_CHILD";

/// Whether this process was started by [`run_child`].
pub fn is_child() -> bool {
    env::var_os(CHILD_VAR).is_some()
}

/// Re-run this test binary with only `test` selected, stdin closed and the
/// tracker configured by `vars` alone.
pub fn run_child(test: &str, vars: &[(&str, &str)]) -> Output {
    let exe = env::current_exe().expect("test binary path");
    let mut cmd = Command::new(exe);
    cmd.args(["--exact", test, "--nocapture", "--test-threads=1"])
        .env(CHILD_VAR, "1")
        .stdin(Stdio::null());
    for var in [
        "MEMTRACK_PADDING",
        "MEMTRACK_FRESH",
        "MEMTRACK_RETIRED",
        "MEMTRACK_PAUSE",
        "MEMTRACK_VERBOSE",
    ] {
        cmd.env_remove(var);
    }
    cmd.envs(vars.iter().copied());
    cmd.output().expect("spawn test binary")
}

/// Lines of `stderr` containing every one of `needles`.
pub fn lines_with<'a>(stderr: &'a str, needles: &[&str]) -> Vec<&'a str> {
    stderr
        .lines()
        .filter(|line| needles.iter().all(|n| line.contains(n)))
        .collect()
}
