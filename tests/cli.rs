use assert_cmd::Command;
use tempfile::TempDir;

fn tally() -> Command {
    Command::cargo_bin("tally").unwrap()
}

#[test]
fn one_shot_commands_succeed_on_a_fresh_data_dir() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_str().unwrap();

    tally()
        .args(["update-counters", "--stats", "apps", "--data-dir", data_dir])
        .assert()
        .success();
    tally()
        .args(["update-cache", "--stats", "tasks", "--data-dir", data_dir])
        .assert()
        .success();
    tally()
        .args(["strip-db", "--days", "30", "--data-dir", data_dir])
        .assert()
        .success();
    tally()
        .args(["clear", "--data-dir", data_dir])
        .assert()
        .success();
}

#[test]
fn find_anomalies_reports_a_count() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_str().unwrap();

    tally()
        .args([
            "find-anomalies",
            "--refhours",
            "6",
            "--checkhours",
            "1",
            "--sensitivity",
            "0.7",
            "--data-dir",
            data_dir,
        ])
        .assert()
        .success()
        .stdout("0 anomalies detected\n");
}

#[test]
fn unknown_stats_kind_is_rejected() {
    let dir = TempDir::new().unwrap();
    tally()
        .args([
            "update-counters",
            "--stats",
            "bogus",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .failure();
}

#[test]
fn invalid_anomaly_windows_are_rejected() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_str().unwrap();

    // Reference window must exceed the check window.
    tally()
        .args([
            "find-anomalies",
            "--refhours",
            "1",
            "--checkhours",
            "6",
            "--sensitivity",
            "0.7",
            "--data-dir",
            data_dir,
        ])
        .assert()
        .failure();

    // Sensitivity outside (0, 1).
    tally()
        .args([
            "find-anomalies",
            "--refhours",
            "6",
            "--checkhours",
            "1",
            "--sensitivity",
            "1.5",
            "--data-dir",
            data_dir,
        ])
        .assert()
        .failure();
}

#[test]
fn strip_db_requires_a_positive_age() {
    let dir = TempDir::new().unwrap();
    tally()
        .args([
            "strip-db",
            "--days",
            "0",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .failure();
}
