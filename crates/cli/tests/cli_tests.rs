//! CLI integration tests

use ensemble_lib::ensemble::Publisher;
use ensemble_lib::{EnsembleModel, MemberWeight, Metric, ModelId, Split, TaskType};
use ndarray::Array2;
use ndarray_npy::write_npy;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn ensb(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ensb"))
        .args(args)
        .env_remove("ENSEMBLE_WORK_DIR")
        .env_remove("ENSEMBLE_OUTPUT_DIR")
        .output()
        .expect("Failed to execute command")
}

fn json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

fn write_prediction(work_dir: &Path, split: Split, id: ModelId, rows: usize) {
    let dir = work_dir.join(split.dir_name());
    fs::create_dir_all(&dir).unwrap();
    write_npy(
        dir.join(split.file_name(id)),
        &Array2::<f64>::from_elem((rows, 2), 0.5),
    )
    .unwrap();
}

fn sample_ensemble() -> EnsembleModel {
    let a = ModelId::new(1, 2);
    let c = ModelId::new(1, 4);
    EnsembleModel {
        task: TaskType::BinaryClassification,
        metric: Metric::Accuracy,
        ensemble_size: 4,
        candidates: vec![c, a],
        picks: vec![c, a, c, c],
        members: vec![
            MemberWeight { id: c, weight: 0.75 },
            MemberWeight { id: a, weight: 0.25 },
        ],
        trajectory: vec![0.95, 0.95, 0.95, 0.95],
        input_hash: "ab".repeat(32),
        fitted_at: 1_700_000_000,
    }
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = ensb(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Ensemble Builder"), "Should show app name");
    assert!(stdout.contains("candidates"), "Should show candidates command");
    assert!(stdout.contains("ensembles"), "Should show ensembles command");
    assert!(stdout.contains("predictions"), "Should show predictions command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = ensb(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("ensb"), "Should show binary name");
}

#[test]
fn test_candidates_json() {
    let dir = TempDir::new().unwrap();
    write_prediction(dir.path(), Split::Ensemble, ModelId::new(1, 2), 20);
    write_prediction(dir.path(), Split::Valid, ModelId::new(1, 2), 5);
    write_prediction(dir.path(), Split::Test, ModelId::new(1, 2), 5);
    write_prediction(dir.path(), Split::Ensemble, ModelId::new(3, 1), 20);

    let work_dir = dir.path().to_str().unwrap();
    let all = json(&ensb(&[
        "--format", "json", "candidates", "--work-dir", work_dir, "--shapes",
    ]));
    let all = all.as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["seed"], 1);
    assert_eq!(all[0]["run_id"], 2);
    assert_eq!(all[0]["valid"], true);
    assert_eq!(all[0]["test"], true);
    assert_eq!(all[0]["shape"], serde_json::json!([20, 2]));
    assert_eq!(all[1]["valid"], false);

    let seed_three = json(&ensb(&[
        "candidates", "--work-dir", work_dir, "--seed", "3", "--format", "json",
    ]));
    assert_eq!(seed_three.as_array().unwrap().len(), 1);
    assert!(seed_three[0].get("shape").is_none());
}

#[test]
fn test_candidates_before_training_starts() {
    let dir = TempDir::new().unwrap();
    let work_dir = dir.path().to_str().unwrap();

    let listed = json(&ensb(&["--format", "json", "candidates", "--work-dir", work_dir]));
    assert_eq!(listed, serde_json::json!([]));

    let output = ensb(&["candidates", "--work-dir", work_dir]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No ensemble predictions yet"));
}

#[test]
fn test_ensembles_list_and_show() {
    let dir = TempDir::new().unwrap();
    let publisher = Publisher::new(dir.path(), &dir.path().join("output"), "demo", 1);
    publisher.save_ensemble(&sample_ensemble(), 0).unwrap();
    publisher.save_ensemble(&sample_ensemble(), 1).unwrap();

    let work_dir = dir.path().to_str().unwrap();
    let listed = json(&ensb(&[
        "--format", "json", "ensembles", "list", "--work-dir", work_dir,
    ]));
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1]["index"], 1);
    assert_eq!(listed[1]["members"], 2);

    // Latest index by default
    let shown = json(&ensb(&[
        "--format", "json", "ensembles", "show", "--work-dir", work_dir, "--seed", "1",
    ]));
    assert_eq!(shown["members"][0]["weight"], 0.75);
    assert_eq!(shown["picks"].as_array().unwrap().len(), 4);

    let table = ensb(&[
        "ensembles", "show", "--work-dir", work_dir, "--seed", "1", "--index", "0",
    ]);
    assert!(table.status.success());
    assert!(String::from_utf8_lossy(&table.stdout).contains("Ensemble 1.0000000000"));

    let missing = ensb(&["ensembles", "show", "--work-dir", work_dir, "--seed", "9"]);
    assert!(!missing.status.success());
}

#[test]
fn test_unreadable_ensemble_keeps_json_output_valid() {
    let dir = TempDir::new().unwrap();
    let publisher = Publisher::new(dir.path(), &dir.path().join("output"), "demo", 1);
    publisher.save_ensemble(&sample_ensemble(), 0).unwrap();
    fs::write(dir.path().join("ensembles").join("1.0000000001.ensemble"), "{ truncated").unwrap();

    let work_dir = dir.path().to_str().unwrap();
    let output = ensb(&["--format", "json", "ensembles", "list", "--work-dir", work_dir]);
    let listed = json(&output);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["index"], 0);
    assert!(String::from_utf8_lossy(&output.stderr).contains("Skipping"));
}

#[test]
fn test_predictions_filtered_by_dataset() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("demo_valid_000.predict"), "0.5\n0.25\n0.75\n").unwrap();
    fs::write(dir.path().join("demo_test_000.predict"), "0.5\n0.25\n").unwrap();
    fs::write(dir.path().join("other_set_valid_003.predict"), "0.1 0.9\n").unwrap();
    fs::write(dir.path().join("notes.txt"), "not a prediction").unwrap();

    let output_dir = dir.path().to_str().unwrap();
    let all = json(&ensb(&[
        "--format", "json", "predictions", "--output-dir", output_dir,
    ]));
    assert_eq!(all.as_array().unwrap().len(), 3);

    let demo = json(&ensb(&[
        "--format", "json", "predictions", "--output-dir", output_dir, "--dataset", "demo",
    ]));
    let demo = demo.as_array().unwrap();
    assert_eq!(demo.len(), 2);
    let valid = demo.iter().find(|p| p["split"] == "valid").unwrap();
    assert_eq!(valid["rows"], 3);
    assert_eq!(valid["columns"], 1);

    let other = json(&ensb(&[
        "--format", "json", "predictions", "--output-dir", output_dir, "--dataset", "other_set",
    ]));
    assert_eq!(other[0]["index"], 3);
    assert_eq!(other[0]["columns"], 2);
}
