//! End-to-end sweeps against real shell-script workloads

#![cfg(unix)]

use std::path::{Path, PathBuf};

use sweep_bench_core::{BenchError, ByteSize, PointStatus, Sweep, SweepConfig};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn sizes(labels: &[&str]) -> Vec<ByteSize> {
    labels.iter().map(|s| s.parse().unwrap()).collect()
}

const RECORD_SCRIPT: &str = r#"printf '{"pid": %d, "args": "%s"}\n' $$ "$*""#;

#[tokio::test]
async fn test_two_by_two_grid_writes_four_files() {
    let tmp = tempfile::TempDir::new().unwrap();
    let script = write_script(tmp.path(), "workload.sh", RECORD_SCRIPT);
    let out = tmp.path().join("results");

    let config = SweepConfig::new(&script, sizes(&["16K", "32K"]), vec![1.0, 0.5])
        .with_iterations(10)
        .with_fan_out(16)
        .with_max_parallel(16)
        .with_output_dir(&out);
    let sweep = Sweep::new(config).unwrap();
    assert_eq!(sweep.grid().len(), 4);

    let summary = sweep.run().await.unwrap();
    assert!(summary.is_success());

    let plan = sweep.plan();
    assert_eq!(plan.len(), 4);
    for planned in &plan {
        let bytes = std::fs::read(out.join(&planned.file_name)).unwrap();
        let records: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let records = records.as_array().unwrap();

        assert_eq!(records.len(), 16);
        for record in records {
            assert!(record.is_object());
            let args = record["args"].as_str().unwrap();
            assert!(args.contains("--iterations 10"));
            assert!(args.contains("--json"));
        }
    }

    // four result files plus the manifest
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 5);
}

#[tokio::test]
async fn test_rerun_overwrites_same_files() {
    let tmp = tempfile::TempDir::new().unwrap();
    let script = write_script(tmp.path(), "workload.sh", RECORD_SCRIPT);
    let out = tmp.path().join("results");

    let config = SweepConfig::new(&script, sizes(&["16K"]), vec![1.0, 0.5])
        .with_fan_out(2)
        .with_max_parallel(2)
        .with_output_dir(&out);

    let first = Sweep::new(config.clone()).unwrap();
    first.run().await.unwrap();
    let mut before: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    before.sort();

    let second = Sweep::new(config).unwrap();
    second.run().await.unwrap();
    let mut after: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    after.sort();

    assert_eq!(before, after);
}

#[tokio::test]
async fn test_failing_point_gets_marker_not_results() {
    let tmp = tempfile::TempDir::new().unwrap();
    let script = write_script(
        tmp.path(),
        "workload.sh",
        &format!(
            "case \"$*\" in *\"--size 32K\"*) echo 'mmap failed' >&2; exit 1;; esac\n{}",
            RECORD_SCRIPT
        ),
    );
    let out = tmp.path().join("results");

    let config = SweepConfig::new(&script, sizes(&["16K", "32K"]), vec![1.0])
        .with_fan_out(4)
        .with_max_parallel(4)
        .with_output_dir(&out);
    let sweep = Sweep::new(config).unwrap();

    let summary = sweep.run().await.unwrap();
    assert!(!summary.is_success());

    let statuses: Vec<PointStatus> = summary.points.iter().map(|p| p.status).collect();
    assert_eq!(statuses, vec![PointStatus::Succeeded, PointStatus::Failed]);

    let plan = sweep.plan();
    assert!(out.join(&plan[0].file_name).exists());
    assert!(!out.join(&plan[1].file_name).exists());

    let marker = out.join(sweep.store().namer().failure_marker_name(&plan[1].point));
    let body: serde_json::Value = serde_json::from_slice(&std::fs::read(marker).unwrap()).unwrap();
    assert_eq!(body["failures"].as_array().unwrap().len(), 4);
    assert_eq!(body["failures"][0]["reason"]["kind"], "non_zero_exit");
    assert!(body["failures"][0]["stderr_tail"]
        .as_str()
        .unwrap()
        .contains("mmap failed"));
}

#[tokio::test]
async fn test_processes_axis_sets_fan_out() {
    let tmp = tempfile::TempDir::new().unwrap();
    let script = write_script(tmp.path(), "workload.sh", RECORD_SCRIPT);
    let out = tmp.path().join("results");

    let mut config = SweepConfig::new(&script, sizes(&["16K"]), vec![1.0])
        .with_max_parallel(8)
        .with_output_dir(&out);
    config.axes.processes = Some(vec![1, 3]);
    let sweep = Sweep::new(config).unwrap();

    let summary = sweep.run().await.unwrap();
    assert!(summary.is_success());

    let lengths: Vec<usize> = sweep
        .plan()
        .iter()
        .map(|planned| {
            let bytes = std::fs::read(out.join(&planned.file_name)).unwrap();
            let records: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            records.as_array().unwrap().len()
        })
        .collect();
    assert_eq!(lengths, vec![1, 3]);
}

#[tokio::test]
async fn test_missing_workload_aborts_sweep() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = tmp.path().join("results");

    let config = SweepConfig::new(tmp.path().join("no-such-binary"), sizes(&["16K", "32K"]), vec![1.0])
        .with_fan_out(4)
        .with_max_parallel(2)
        .with_output_dir(&out);
    let sweep = Sweep::new(config).unwrap();

    let err = sweep.run().await.unwrap_err();
    assert!(matches!(err, BenchError::Launch { .. }));
    assert!(err.is_fatal());
    assert!(!out.exists());
}
