//! End-to-end tests for the `tern` binary.
//!
//! Each test gets its own project directory and config home so nothing
//! from the developer's environment leaks in.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Sandbox {
    _tmp: tempfile::TempDir,
    project: PathBuf,
    config_home: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let project = tmp.path().join("project");
        let config_home = tmp.path().join("config");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::create_dir_all(&config_home).unwrap();
        Self {
            _tmp: tmp,
            project,
            config_home,
        }
    }

    fn tern(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_tern"))
            .arg("--project-dir")
            .arg(&self.project)
            .args(args)
            .env("XDG_CONFIG_HOME", &self.config_home)
            .env_remove("TERN_CONFIG")
            .env_remove("TERN_STATE_DIR")
            .env("RUST_LOG", "warn")
            .output()
            .expect("run tern")
    }

    fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.project.join(relative);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// A config whose only provider echoes a fixed reply.
    fn echo_config(&self, reply: &str) -> PathBuf {
        self.write(
            ".tern/config.toml",
            &format!(
                r#"
default_provider = "echo"

[[providers]]
id = "echo"
kind = "cli-passthrough"
command = "sh"
args = ["-c", "echo {reply}"]
"#
            ),
        )
    }

    /// Replace the analyze catalog with two short steps.
    fn short_catalog(&self) {
        self.write(
            ".tern/steps/analyze.toml",
            r#"
[[steps]]
id = "01_SURVEY"
title = "Survey"

[[steps]]
id = "02_REPORT"
title = "Report"
dependencies = ["01_SURVEY"]
"#,
        );
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn status_json(sandbox: &Sandbox) -> serde_json::Value {
    let output = sandbox.tern(&["status", "analyze", "--json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    serde_json::from_slice(&output.stdout).expect("status --json prints JSON")
}

#[test]
fn config_show_falls_back_to_defaults() {
    let sandbox = Sandbox::new();
    let output = sandbox.tern(&["config", "show"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("# source: built-in defaults"), "{out}");
    assert!(out.contains("id = \"claude\""), "{out}");
}

#[test]
fn config_init_writes_project_config_once() {
    let sandbox = Sandbox::new();
    let first = sandbox.tern(&["config", "init"]);
    assert!(first.status.success(), "{}", stderr(&first));
    assert!(sandbox.project.join(".tern/config.toml").exists());

    let second = sandbox.tern(&["config", "init"]);
    assert!(!second.status.success());
    assert!(stderr(&second).contains("already exists"));

    let show = sandbox.tern(&["config", "show"]);
    assert!(stdout(&show).contains("(project)"), "{}", stdout(&show));
}

#[test]
fn providers_lists_configured_providers() {
    let sandbox = Sandbox::new();
    sandbox.echo_config("done");
    let output = sandbox.tern(&["providers"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("echo"), "{out}");
    assert!(out.contains("cli-passthrough"), "{out}");
    assert!(out.contains("(default)"), "{out}");
}

#[test]
fn status_before_any_run_is_idle() {
    let sandbox = Sandbox::new();
    let output = sandbox.tern(&["status", "execute"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("State: idle"), "{out}");
    assert!(out.contains("00_PRD"), "{out}");
    assert!(out.contains("[gate]"), "{out}");
}

#[test]
fn unknown_mode_is_rejected() {
    let sandbox = Sandbox::new();
    let output = sandbox.tern(&["status", "deploy"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid mode"), "{}", stderr(&output));
}

#[cfg(unix)]
#[test]
fn run_completes_every_step_and_reports_status() {
    let sandbox = Sandbox::new();
    sandbox.echo_config("done");
    sandbox.short_catalog();

    let output = sandbox.tern(&["run", "analyze"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("analyze workflow completed (2 steps)"));

    let run = status_json(&sandbox);
    assert_eq!(run["state"], "completed");
    assert_eq!(
        run["completed_steps"],
        serde_json::json!(["01_SURVEY", "02_REPORT"])
    );

    let outputs = sandbox.project.join(".tern");
    assert!(has_file_containing(&outputs, "01_SURVEY"));

    let history = sandbox.tern(&["checkpoint", "history", "analyze", "--limit", "1"]);
    assert!(history.status.success());
    assert!(stdout(&history).contains("completed"), "{}", stdout(&history));

    let jobs = sandbox.tern(&["jobs", "list"]);
    assert!(jobs.status.success(), "{}", stderr(&jobs));
    let listing = stdout(&jobs);
    assert_eq!(listing.matches("succeeded").count(), 2, "{listing}");
    assert!(listing.contains("02_REPORT"), "{listing}");
}

#[cfg(unix)]
#[test]
fn targeted_step_with_unmet_dependencies_fails_without_touching_state() {
    let sandbox = Sandbox::new();
    sandbox.echo_config("done");
    sandbox.short_catalog();

    let output = sandbox.tern(&["run", "analyze", "02_REPORT"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("01_SURVEY"), "{}", stderr(&output));

    let show = sandbox.tern(&["checkpoint", "show", "analyze"]);
    assert!(stdout(&show).contains("No checkpoint"), "{}", stdout(&show));
}

#[cfg(unix)]
#[test]
fn reset_returns_the_workflow_to_idle() {
    let sandbox = Sandbox::new();
    sandbox.echo_config("done");
    sandbox.short_catalog();

    assert!(sandbox.tern(&["run", "analyze"]).status.success());
    let reset = sandbox.tern(&["reset", "analyze"]);
    assert!(reset.status.success(), "{}", stderr(&reset));

    let run = status_json(&sandbox);
    assert_eq!(run["state"], "idle");
    assert_eq!(run["completed_steps"], serde_json::json!([]));
}

#[test]
fn completions_are_generated() {
    let sandbox = Sandbox::new();
    let output = sandbox.tern(&["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("tern"));
}

fn has_file_containing(dir: &Path, needle: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let path = entry.path();
        if path.is_dir() {
            has_file_containing(&path, needle)
        } else {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().contains(needle))
        }
    })
}
