//! Integration tests for the `strip-blur` binary.
//!
//! Run with: cargo test --test cli_test

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use strip_blur::{codec, Image};

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_strip-blur"))
}

fn write_input(dir: &Path, width: u32, height: u32) -> PathBuf {
    let path = dir.join("input.png");
    let image = Image::from_fn(width, height, |x, y| {
        [(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8]
    });
    codec::encode(&image, &path).expect("Failed to write test input");
    path
}

fn run(dir: &Path, args: &[&str]) -> Output {
    Command::new(binary())
        .current_dir(dir)
        .arg("--config")
        .arg(dir.join("absent.toml"))
        .arg("run")
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute strip-blur")
}

// =============================================================================
// CLI Tests
// =============================================================================

#[test]
fn test_help_hides_worker() {
    let output = Command::new(binary())
        .arg("--help")
        .output()
        .expect("Failed to execute strip-blur");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"), "Help text should mention run");
    assert!(!stdout.contains("worker"), "Worker subcommand should be hidden");
}

#[test]
fn test_run_each_transport_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 60, 20);

    for transport in ["pipe", "pool", "shared"] {
        let out_name = format!("out_{transport}.png");
        let output = run(
            dir.path(),
            &[
                input.to_str().unwrap(),
                "-n",
                "4",
                "--transport",
                transport,
                "-o",
                &out_name,
            ],
        );
        assert!(
            output.status.success(),
            "{transport} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        let blurred = codec::decode(&dir.path().join(&out_name)).unwrap();
        assert_eq!((blurred.width(), blurred.height()), (60, 20));
    }

    let pipe = codec::decode(&dir.path().join("out_pipe.png")).unwrap();
    let pool = codec::decode(&dir.path().join("out_pool.png")).unwrap();
    let shared = codec::decode(&dir.path().join("out_shared.png")).unwrap();
    assert_eq!(pipe, pool);
    assert_eq!(pipe, shared);
}

#[test]
fn test_save_strips_numbers_from_one() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 30, 10);

    let output = run(
        dir.path(),
        &[
            input.to_str().unwrap(),
            "-n",
            "3",
            "--save-strips",
            "blurred_part",
            "--round-trip-shared",
            "-o",
            "combined.png",
        ],
    );
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    for n in 1..=3 {
        let part = dir.path().join(format!("blurred_part_{n}.jpg"));
        assert!(part.exists(), "missing {}", part.display());
    }
    assert!(!dir.path().join("blurred_part_0.jpg").exists());
    assert!(dir.path().join("combined.png").exists());
}

#[test]
fn test_round_trip_shared_matches_plain_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 45, 12);

    for transport in ["pipe", "pool"] {
        let plain_name = format!("plain_{transport}.png");
        let tripped_name = format!("tripped_{transport}.png");
        let mut args = vec![input.to_str().unwrap(), "-n", "4", "--transport", transport];

        args.extend(["-o", plain_name.as_str()]);
        let plain = run(dir.path(), &args);
        assert!(plain.status.success(), "{}", String::from_utf8_lossy(&plain.stderr));

        args.truncate(5);
        args.extend(["--round-trip-shared", "-o", tripped_name.as_str()]);
        let tripped = run(dir.path(), &args);
        assert!(tripped.status.success(), "{}", String::from_utf8_lossy(&tripped.stderr));

        let expected = codec::decode(&dir.path().join(&plain_name)).unwrap();
        let actual = codec::decode(&dir.path().join(&tripped_name)).unwrap();
        assert_eq!(actual, expected, "{transport}");
    }
}

#[test]
fn test_default_output_name() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 16, 8);

    let output = run(dir.path(), &[input.to_str().unwrap(), "-n", "2"]);
    assert!(output.status.success());
    assert!(dir.path().join("input_blurred.png").exists());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("input_blurred.png"), "stdout: {stdout}");
}

#[test]
fn test_invalid_strip_count_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 8, 8);

    for n in ["0", "9"] {
        let output = run(dir.path(), &[input.to_str().unwrap(), "-n", n, "-o", "out.png"]);
        assert!(!output.status.success(), "-n {n} should fail");
        assert!(!dir.path().join("out.png").exists());
    }
}

#[test]
fn test_logs_stay_off_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 12, 6);

    let output = run(
        dir.path(),
        &[
            input.to_str().unwrap(),
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "-o",
            "out.png",
        ],
    );
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1, "stdout: {stdout}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Run complete"));
}
