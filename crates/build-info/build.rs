use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=RELAY_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=.git/HEAD");

    if let Some(path) = git_head_ref() {
        println!("cargo:rerun-if-changed={}", path);
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_describe().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("RELAY_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=RELAY_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=RELAY_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=RELAY_BUILD_GIT={}", git_label);
}

/// Path of the ref HEAD points at, so a new commit re-runs the script.
fn git_head_ref() -> Option<String> {
    let head = fs::read_to_string(".git/HEAD").ok()?;
    let reference = head.strip_prefix("ref: ")?.trim();
    let ref_path = format!(".git/{}", reference);
    Path::new(&ref_path).exists().then_some(ref_path)
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
