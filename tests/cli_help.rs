use std::{fmt::Write as _, fs, path::Path};

use anyhow::{Context, Result};
use assert_cmd::Command;
use tempfile::{TempDir, tempdir};

struct HelpCase {
    path: &'static [&'static str],
    expected_snippet: &'static str,
}

const HELP_CASES: &[HelpCase] = &[
    HelpCase {
        path: &[],
        expected_snippet: "bucketdb object-store document CLI",
    },
    HelpCase {
        path: &["compact"],
        expected_snippet: "Merge per-id manifests into hash-sharded NDJSON files",
    },
    HelpCase {
        path: &["compact"],
        expected_snippet: "--since <SINCE>",
    },
    HelpCase {
        path: &["serve"],
        expected_snippet: "Run the change-notification and read service",
    },
    HelpCase {
        path: &["serve"],
        expected_snippet: "--role <ROLE>",
    },
    HelpCase {
        path: &["doc"],
        expected_snippet: "Write and read documents",
    },
    HelpCase {
        path: &["doc", "put"],
        expected_snippet: "Record a payload and make it current when it is newer",
    },
    HelpCase {
        path: &["doc", "get"],
        expected_snippet: "Print the current snapshot",
    },
    HelpCase {
        path: &["doc", "history"],
        expected_snippet: "Print every recorded payload in write order",
    },
    HelpCase {
        path: &["reindex"],
        expected_snippet: "Rebuild index pointers from the stored snapshots",
    },
];

#[test]
fn cli_help_regressions() -> Result<()> {
    for case in HELP_CASES {
        let stdout = run_help(case.path)
            .with_context(|| format!("command {:?} --help failed", case.path))?;
        assert!(
            stdout.contains(case.expected_snippet),
            "expected help for {:?} to contain {:?}\nstdout:\n{}",
            case.path,
            case.expected_snippet,
            indent_output(&stdout)
        );
    }
    Ok(())
}

#[test]
fn compact_requires_env_and_entity() -> Result<()> {
    let sandbox = tempdir()?;
    let output = bucketdb(sandbox.path())?.arg("compact").output()?;
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--env"), "stderr:\n{}", indent_output(&stderr));
    Ok(())
}

#[test]
fn compact_rejects_unparseable_since() -> Result<()> {
    let sandbox = tempdir()?;
    let bucket = data_dir(&sandbox)?;
    let output = bucketdb(sandbox.path())?
        .args(["compact", "--env", "dev", "--entity", "idea"])
        .args(["--bucket", &bucket, "--since", "last tuesday"])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid --since"),
        "stderr:\n{}",
        indent_output(&stderr)
    );
    Ok(())
}

#[test]
fn compact_writes_shards_for_a_local_bucket() -> Result<()> {
    let sandbox = tempdir()?;
    let bucket = data_dir(&sandbox)?;
    for (id, status) in [("I1", "New"), ("I2", "Approved"), ("I3", "New")] {
        let payload = sandbox.path().join(format!("{id}.json"));
        fs::write(
            &payload,
            format!(r#"{{"title":"Idea {id}","status":"{status}","updated_at":"2025-03-01T00:00:00Z"}}"#),
        )?;
        let output = bucketdb(sandbox.path())?
            .args(["doc", "put", "--env", "dev", "--entity", "idea", "--id", id])
            .args(["--bucket", &bucket])
            .arg("--file")
            .arg(&payload)
            .output()?;
        assert!(
            output.status.success(),
            "doc put {id} failed:\n{}",
            indent_output(&String::from_utf8_lossy(&output.stderr))
        );
    }

    let output = bucketdb(sandbox.path())?
        .args(["compact", "--env", "dev", "--entity", "idea", "--shards", "2"])
        .args(["--bucket", &bucket])
        .output()?;
    let stdout = String::from_utf8(output.stdout)?;
    assert!(
        output.status.success(),
        "stderr:\n{}",
        indent_output(&String::from_utf8_lossy(&output.stderr))
    );
    assert!(stdout.contains("shard"), "stdout:\n{}", indent_output(&stdout));
    assert!(stdout.contains("3 listed"), "stdout:\n{}", indent_output(&stdout));

    // A second full pass finds every shard already up to date.
    let output = bucketdb(sandbox.path())?
        .args(["compact", "--env", "dev", "--entity", "idea", "--shards", "2", "--json"])
        .args(["--bucket", &bucket])
        .output()?;
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let shards = report["shards"].as_array().context("shards array")?;
    assert!(!shards.is_empty());
    assert!(shards.iter().all(|shard| shard["status"] == "unchanged"));
    Ok(())
}

fn bucketdb(sandbox: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("bucketdb")?;
    cmd.arg("--config").arg(sandbox.join("missing-config.toml"));
    cmd.env("BUCKETDB_LOG_DIR", sandbox.join("logs"));
    cmd.env_remove("BUCKETDB_BUCKET");
    Ok(cmd)
}

fn data_dir(sandbox: &TempDir) -> Result<String> {
    let dir = sandbox.path().join("data");
    fs::create_dir_all(&dir)?;
    Ok(format!("file://{}", dir.display()))
}

fn run_help(path: &[&str]) -> Result<String> {
    let temp_log = tempdir()?;
    let mut cmd = Command::cargo_bin("bucketdb")?;
    cmd.args(path);
    cmd.arg("--help");
    cmd.env("BUCKETDB_LOG_DIR", temp_log.path());
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "bucketdb {:?} --help exited with {}: {}",
            path,
            output.status,
            stderr
        );
    }
    let stdout = String::from_utf8(output.stdout)?.replace("\r\n", "\n");
    Ok(stdout)
}

fn indent_output(output: &str) -> String {
    let mut indented = String::new();
    for line in output.lines() {
        let _ = writeln!(&mut indented, "    {}", line);
    }
    indented
}
