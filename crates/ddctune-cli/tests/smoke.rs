use std::process::Command;

use tempfile::tempdir;

fn ddctune() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ddctune"))
}

#[test]
fn simulate_learns_and_persists() {
    let dir = tempdir().unwrap();
    let stats = dir.path().join("stats");

    let output = ddctune()
        .args([
            "--cache-file",
            stats.to_str().unwrap(),
            "simulate",
            "--displays",
            "2",
            "--loops",
            "40",
            "--error-rate",
            "0.2",
            "--seed",
            "7",
            "--save",
        ])
        .output()
        .expect("failed to run ddctune");

    assert!(
        output.status.success(),
        "ddctune exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("attached 2 simulated display(s)"), "{stdout}");
    assert!(stdout.contains("saved 2 record(s)"), "{stdout}");

    let contents = std::fs::read_to_string(&stats).unwrap();
    assert!(contents.contains("FORMAT 1"), "{contents}");
    assert!(contents.contains("i2c-3 "), "{contents}");
    assert!(contents.contains("i2c-4 "), "{contents}");
}

#[test]
fn stats_renders_the_saved_cache_as_json() {
    let dir = tempdir().unwrap();
    let stats = dir.path().join("stats");

    let run = ddctune()
        .args([
            "--cache-file",
            stats.to_str().unwrap(),
            "simulate",
            "--displays",
            "1",
            "--loops",
            "10",
            "--save",
        ])
        .output()
        .unwrap();
    assert!(run.status.success());

    let output = ddctune()
        .args(["--cache-file", stats.to_str().unwrap(), "stats", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let displays = report["displays"].as_array().unwrap();
    assert_eq!(displays.len(), 1);
    assert_eq!(displays[0]["bus"], "i2c-3");
    assert_eq!(displays[0]["from_cache"], true);
}

#[test]
fn corrupt_cache_is_reported_but_not_fatal() {
    let dir = tempdir().unwrap();
    let stats = dir.path().join("stats");
    std::fs::write(&stats, "FORMAT 1\ni2c-3 zz 5 5 2 3 1\n").unwrap();

    let output = ddctune()
        .args(["--cache-file", stats.to_str().unwrap(), "stats"])
        .output()
        .unwrap();
    assert!(output.status.success(), "cache trouble must not be fatal");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("discarding corrupt stats file"), "{stderr}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no displays recorded"), "{stdout}");
}

#[test]
fn cache_path_and_erase() {
    let dir = tempdir().unwrap();
    let stats = dir.path().join("stats");
    std::fs::write(&stats, "FORMAT 1\n").unwrap();

    let output = ddctune()
        .args(["--cache-file", stats.to_str().unwrap(), "cache", "path"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        stats.to_str().unwrap()
    );

    let output = ddctune()
        .args(["--cache-file", stats.to_str().unwrap(), "cache", "erase"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(!stats.exists());
}
