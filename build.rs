//! Build script for tracklink
//!
//! Sets compile-time environment variables for build identification.

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rustc-env=BUILD_DATE={}", capture("date", &["+%Y-%m-%d"]));
    println!("cargo:rustc-env=BUILD_TIME={}", capture("date", &["+%H:%M:%S"]));
    println!(
        "cargo:rustc-env=GIT_HASH={}",
        capture("git", &["rev-parse", "--short", "HEAD"])
    );

    // Release tarballs build outside a checkout; only watch HEAD when it
    // actually exists
    if Path::new(".git/HEAD").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
    }
}

/// Trimmed stdout of a command, or "unknown" if it cannot run.
fn capture(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
