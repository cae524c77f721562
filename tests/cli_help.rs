use std::fmt::Write as _;

use anyhow::{Context, Result};
use assert_cmd::Command;
use tempfile::tempdir;

struct HelpCase {
    path: &'static [&'static str],
    expected_snippet: &'static str,
}

const HELP_CASES: &[HelpCase] = &[
    HelpCase {
        path: &[],
        expected_snippet: "chainlog event indexer CLI",
    },
    HelpCase {
        path: &["start"],
        expected_snippet: "Start the indexer HTTP server",
    },
    HelpCase {
        path: &["ingest"],
        expected_snippet: "Apply a file (or stdin) of contract events",
    },
    HelpCase {
        path: &["ingest"],
        expected_snippet: "--halt-on-integrity-fault",
    },
    HelpCase {
        path: &["logs"],
        expected_snippet: "Query indexed log entries",
    },
    HelpCase {
        path: &["logs", "ls"],
        expected_snippet: "List log entries, newest first",
    },
    HelpCase {
        path: &["logs", "get"],
        expected_snippet: "Show a single log entry",
    },
    HelpCase {
        path: &["stats"],
        expected_snippet: "Show aggregate statistics",
    },
    HelpCase {
        path: &["stats", "global"],
        expected_snippet: "Totals across every log",
    },
    HelpCase {
        path: &["stats", "daily"],
        expected_snippet: "Per-day rollups",
    },
    HelpCase {
        path: &["stats", "status"],
        expected_snippet: "Ingest cursor and recent integrity faults",
    },
    HelpCase {
        path: &["config"],
        expected_snippet: "Update system configuration",
    },
    HelpCase {
        path: &["remote"],
        expected_snippet: "Query remote chainlog indexers",
    },
    HelpCase {
        path: &["remote", "add"],
        expected_snippet: "Register a remote indexer",
    },
    HelpCase {
        path: &["remote", "logs"],
        expected_snippet: "merged with locally pending records",
    },
    HelpCase {
        path: &["remote", "status"],
        expected_snippet: "Show a remote's ingest cursor",
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

fn run_help(path: &[&str]) -> Result<String> {
    let temp_log = tempdir()?;
    let mut cmd = Command::cargo_bin("chainlog")?;
    cmd.args(path);
    cmd.arg("--help");
    cmd.env("CHAINLOG_LOG_DIR", temp_log.path());
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "chainlog {:?} --help exited with {}: {}",
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
