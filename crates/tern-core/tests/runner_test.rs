//! End-to-end tests for the harness runner against scripted providers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use tern_core::clock::Clock;
use tern_core::{HarnessError, RunOutcome, RunRequest, TransportError};
use tern_store::CheckpointLoad;
use tern_store::models::{FailureKind, Mode, WorkflowRun, WorkflowState};
use tern_test_utils::{
    Reply, ScriptedProvider, TestProject, catalog, harness_config, linear_catalog, provider_config,
};

const MODE: Mode = Mode::Analyze;

fn scripted(id: &str) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(id))
}

fn checkpoint(project: &TestProject) -> WorkflowRun {
    match project.store().load(MODE) {
        CheckpointLoad::Found(run) => *run,
        other => panic!("expected a checkpoint, got {other:?}"),
    }
}

fn answers(pairs: &[(u32, &str)]) -> BTreeMap<u32, String> {
    pairs.iter().map(|(n, a)| (*n, (*a).to_string())).collect()
}

// ===========================================================================
// Happy path
// ===========================================================================

#[tokio::test]
async fn runs_every_step_in_dependency_order() -> Result<()> {
    let project = TestProject::new();
    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.outcome.exit_code(), 0);
    assert!(summary.warnings.is_empty());
    assert_eq!(summary.run.completed_steps, vec!["a", "b", "c"]);
    assert_eq!(provider.prompts(), vec!["do a", "do b", "do c"]);

    let saved = checkpoint(&project);
    assert_eq!(saved.state, WorkflowState::Completed);
    assert_eq!(saved.metrics.steps_completed, 3);
    assert!(saved.current_step_id.is_none());
    assert!(project.store_config().outputs_dir(MODE).join("b.md").exists());
    assert!(!project.store().read_log(MODE).is_empty());
    Ok(())
}

#[tokio::test]
async fn completed_run_is_not_rerun_without_force() -> Result<()> {
    let project = TestProject::new();
    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    runner.run(RunRequest::default(), CancellationToken::new()).await?;
    let again = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(again.outcome, RunOutcome::Completed);
    assert_eq!(provider.calls(), 3);
    Ok(())
}

// ===========================================================================
// Rate limits and provider failover
// ===========================================================================

#[tokio::test]
async fn waits_out_short_rate_limit_on_same_provider() -> Result<()> {
    let project = TestProject::new();
    let provider = Arc::new(ScriptedProvider::new("p1").with_replies([
        Reply::ok("a done"),
        Reply::ok("Rate limit exceeded. Please try again in 30 seconds."),
    ]));
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let clock = project.clock();
    let started = clock.now();
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(provider.calls(), 4);
    assert_eq!(summary.run.metrics.rate_limit_waits, 1);
    assert!(clock.now() - started >= chrono::Duration::seconds(30));
    Ok(())
}

#[tokio::test]
async fn pauses_when_every_provider_is_rate_limited() -> Result<()> {
    let project = TestProject::new();
    let limited = "Usage limit reached. Try again in 2 hours.";
    let providers: Vec<Arc<ScriptedProvider>> = ["p1", "p2", "p3"]
        .iter()
        .map(|id| Arc::new(ScriptedProvider::new(id).with_replies([Reply::ok(limited)])))
        .collect();
    let config = harness_config(vec![
        provider_config("p1", 0, 3),
        provider_config("p2", 1, 3),
        provider_config("p3", 2, 3),
    ]);
    let clock = project.clock();
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &providers);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    let RunOutcome::PausedRateLimited {
        resume_after: Some(resume_after),
    } = summary.outcome
    else {
        panic!("expected paused_rate_limited, got {:?}", summary.outcome);
    };
    assert!(resume_after > clock.now());
    assert_eq!(summary.outcome.exit_code(), 0);
    assert_eq!(summary.run.metrics.provider_switches, 3);
    for (i, provider) in providers.iter().enumerate() {
        assert_eq!(provider.calls(), 1, "provider {i}");
    }

    let saved = checkpoint(&project);
    assert_eq!(saved.state, WorkflowState::PausedRateLimited);
    assert_eq!(saved.resume_after, Some(resume_after));
    assert_eq!(saved.current_step_id.as_deref(), Some("a"));

    // Too early: nothing is invoked.
    let early = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert!(matches!(early.outcome, RunOutcome::PausedRateLimited { .. }));
    assert_eq!(providers[0].calls(), 1);

    // After the limit expires the run resumes and finishes.
    clock.advance(Duration::from_secs(2 * 3600 + 1));
    let resumed = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    Ok(())
}

#[tokio::test]
async fn keeps_waiting_out_short_rate_limits_past_the_attempt_limit() -> Result<()> {
    let project = TestProject::new();
    let throttled = "Rate limit exceeded. Please try again in 5 seconds.";
    let provider = Arc::new(
        ScriptedProvider::new("p1").with_replies(std::iter::repeat_n(Reply::ok(throttled), 12)),
    );
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    assert_eq!(config.harness.max_attempts_per_step, 10);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.run.metrics.rate_limit_waits, 12);
    assert_eq!(summary.run.metrics.retries, 0);
    assert_eq!(provider.calls(), 12 + 3);
    Ok(())
}

#[tokio::test]
async fn pauses_when_every_circuit_is_open() -> Result<()> {
    let project = TestProject::new();
    let providers: Vec<Arc<ScriptedProvider>> = ["p1", "p2", "p3"]
        .iter()
        .map(|id| Arc::new(ScriptedProvider::new(id).with_replies([Reply::exit(1, "boom")])))
        .collect();
    let config = harness_config(vec![
        provider_config("p1", 0, 1),
        provider_config("p2", 1, 1),
        provider_config("p3", 2, 1),
    ]);
    let cooldown = config.retry.circuit_cooldown_secs;
    let clock = project.clock();
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &providers);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    let RunOutcome::PausedRateLimited {
        resume_after: Some(resume_after),
    } = summary.outcome
    else {
        panic!("expected paused_rate_limited, got {:?}", summary.outcome);
    };
    assert_eq!(resume_after, clock.now() + chrono::Duration::seconds(cooldown as i64));
    assert_eq!(summary.run.metrics.provider_switches, 3);
    assert!(summary.run.last_failure.is_some());
    for (i, provider) in providers.iter().enumerate() {
        assert_eq!(provider.calls(), 1, "provider {i}");
    }
    assert!(runner.provider_health().iter().all(|h| h.circuit_open));
    assert_eq!(checkpoint(&project).state, WorkflowState::PausedRateLimited);

    let early = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert!(matches!(early.outcome, RunOutcome::PausedRateLimited { .. }));
    assert_eq!(providers[0].calls(), 1);

    clock.advance(Duration::from_secs(cooldown + 1));
    let resumed = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.run.completed_steps, vec!["a", "b", "c"]);
    Ok(())
}

#[tokio::test]
async fn switches_provider_after_retry_ceiling() -> Result<()> {
    let project = TestProject::new();
    let flaky = Arc::new(ScriptedProvider::new("p1").with_fallback(Reply::exit(1, "boom")));
    let steady = scripted("p2");
    let config = harness_config(vec![provider_config("p1", 0, 2), provider_config("p2", 1, 2)]);
    let mut runner = project.runner(
        MODE,
        config,
        linear_catalog(MODE),
        &[Arc::clone(&flaky), Arc::clone(&steady)],
    );

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(flaky.calls(), 2);
    assert_eq!(steady.calls(), 3);
    assert_eq!(summary.run.metrics.retries, 1);
    assert_eq!(summary.run.metrics.provider_switches, 1);
    assert_eq!(summary.run.current_provider_id.as_deref(), Some("p2"));

    let health = runner.provider_health();
    let p1 = health.iter().find(|h| h.id == "p1").expect("p1 health");
    assert!(p1.circuit_open);
    Ok(())
}

#[tokio::test]
async fn missing_command_switches_without_retrying() -> Result<()> {
    let project = TestProject::new();
    let broken = Arc::new(ScriptedProvider::new("p1").with_fallback(Reply::Fail(
        TransportError::Spawn {
            command: "nope".to_string(),
            message: "No such file or directory".to_string(),
        },
    )));
    let steady = scripted("p2");
    let config = harness_config(vec![provider_config("p1", 0, 3), provider_config("p2", 1, 3)]);
    let mut runner = project.runner(
        MODE,
        config,
        linear_catalog(MODE),
        &[Arc::clone(&broken), Arc::clone(&steady)],
    );

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(broken.calls(), 1);
    assert_eq!(summary.run.metrics.retries, 0);
    Ok(())
}

// ===========================================================================
// Failure
// ===========================================================================

#[tokio::test]
async fn aborts_when_no_provider_can_recover() -> Result<()> {
    let project = TestProject::new();
    let provider = Arc::new(ScriptedProvider::new("p1").with_fallback(Reply::Fail(
        TransportError::Spawn {
            command: "nope".to_string(),
            message: "No such file or directory".to_string(),
        },
    )));
    let config = harness_config(vec![provider_config("p1", 0, 2)]);
    let mut runner = project.runner(MODE, config.clone(), linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    let RunOutcome::Failed(record) = &summary.outcome else {
        panic!("expected failure, got {:?}", summary.outcome);
    };
    assert_eq!(summary.outcome.exit_code(), 1);
    assert_eq!(record.step_id.as_deref(), Some("a"));
    assert_eq!(record.provider_id.as_deref(), Some("p1"));
    assert_eq!(record.kind, FailureKind::Transport);
    assert_eq!(record.attempts, 1);
    assert!(record.message.contains("no provider can recover"), "{}", record.message);

    let saved = checkpoint(&project);
    assert_eq!(saved.state, WorkflowState::Failed);
    assert_eq!(saved.last_failure.as_ref(), Some(record));

    // A failed run stays failed unless forced.
    let again = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert!(matches!(again.outcome, RunOutcome::Failed(_)));
    assert_eq!(provider.calls(), 1);

    // A new process with a working provider can force it forward.
    let fixed = scripted("p1");
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&fixed)]);
    let forced = runner
        .run(
            RunRequest {
                force: true,
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await?;
    assert_eq!(forced.outcome, RunOutcome::Completed);
    assert!(forced.run.last_failure.is_none());
    assert_eq!(fixed.prompts()[0], "do a");
    Ok(())
}

#[tokio::test]
async fn gives_up_at_attempt_limit() -> Result<()> {
    let project = TestProject::new();
    let provider = Arc::new(ScriptedProvider::new("p1").with_fallback(Reply::exit(1, "boom")));
    let mut config = harness_config(vec![provider_config("p1", 0, 5)]);
    config.harness.max_attempts_per_step = 2;
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    let RunOutcome::Failed(record) = summary.outcome else {
        panic!("expected failure");
    };
    assert!(record.message.contains("gave up after 2 attempts"), "{}", record.message);
    assert_eq!(provider.calls(), 2);
    Ok(())
}

// ===========================================================================
// User input
// ===========================================================================

#[tokio::test]
async fn pauses_for_questions_and_resumes_with_answers() -> Result<()> {
    let project = TestProject::new();
    let provider = Arc::new(ScriptedProvider::new("p1").with_replies([Reply::ok(
        "I need your input before continuing:\n\n1. Which database?\n2. Which cloud? (optional)\n",
    )]));
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    let RunOutcome::PausedForUserInput { step_id, questions } = &summary.outcome else {
        panic!("expected a pause, got {:?}", summary.outcome);
    };
    assert_eq!(step_id, "a");
    assert_eq!(questions.len(), 2);
    assert!(questions[0].required);
    assert!(!questions[1].required);
    assert_eq!(checkpoint(&project).state, WorkflowState::PausedUserFeedback);

    // Without the required answer the run stays paused.
    let unanswered = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert!(matches!(unanswered.outcome, RunOutcome::PausedForUserInput { .. }));
    assert!(!unanswered.warnings.is_empty());
    assert_eq!(provider.calls(), 1);

    let resumed = runner
        .run(
            RunRequest {
                answers: answers(&[(1, "Postgres")]),
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await?;

    assert_eq!(resumed.outcome, RunOutcome::Completed);
    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 4);
    assert!(prompts[1].starts_with("do a"));
    assert!(prompts[1].contains("## Answers to your previous questions"));
    assert!(prompts[1].contains("1. Postgres"));
    assert!(resumed.run.pending_input.is_none());
    Ok(())
}

#[tokio::test]
async fn gated_step_waits_for_approval() -> Result<()> {
    let project = TestProject::new();
    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let steps = catalog(MODE, &[("prd", &[], true), ("build", &["prd"], false)]);
    let mut runner = project.runner(MODE, config, steps, &[Arc::clone(&provider)]);

    let first = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    let RunOutcome::PausedForUserInput { step_id, questions } = &first.outcome else {
        panic!("expected approval pause, got {:?}", first.outcome);
    };
    assert_eq!(step_id, "prd");
    assert_eq!(questions.len(), 1);
    assert!(!first.run.is_completed("prd"));

    // Rejection re-runs the step with the feedback.
    let rejected = runner
        .run(
            RunRequest {
                answers: answers(&[(1, "Add an error handling section")]),
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await?;
    assert!(matches!(rejected.outcome, RunOutcome::PausedForUserInput { .. }));
    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("## Reviewer feedback"));
    assert!(prompts[1].contains("- Add an error handling section"));

    let approved = runner
        .run(
            RunRequest {
                answers: answers(&[(1, "yes")]),
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await?;
    assert_eq!(approved.outcome, RunOutcome::Completed);
    assert_eq!(approved.run.completed_steps, vec!["prd", "build"]);
    assert_eq!(provider.calls(), 3);
    Ok(())
}

// ===========================================================================
// Targeted steps
// ===========================================================================

#[tokio::test]
async fn unmet_dependencies_leave_checkpoint_untouched() -> Result<()> {
    let project = TestProject::new();
    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let err = runner
        .run(
            RunRequest {
                step: Some("c".to_string()),
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        HarnessError::DependencyUnmet { step_id, missing } => {
            assert_eq!(step_id, "c");
            assert_eq!(missing, vec!["b"]);
        }
        other => panic!("expected DependencyUnmet, got {other}"),
    }
    assert!(matches!(project.store().load(MODE), CheckpointLoad::Missing));
    assert_eq!(provider.calls(), 0);

    let err = runner
        .run(
            RunRequest {
                step: Some("zz".to_string()),
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::UnknownStep { .. }));
    Ok(())
}

#[tokio::test]
async fn forced_step_reruns_completed_work() -> Result<()> {
    let project = TestProject::new();
    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);
    runner.run(RunRequest::default(), CancellationToken::new()).await?;

    let summary = runner
        .run(
            RunRequest {
                step: Some("b".to_string()),
                force: true,
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(provider.prompts().last().map(String::as_str), Some("do b"));
    assert_eq!(provider.calls(), 4);
    assert!(summary.run.is_completed("b"));
    Ok(())
}

#[tokio::test]
async fn forced_step_skips_unmet_dependencies() -> Result<()> {
    let project = TestProject::new();
    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let summary = runner
        .run(
            RunRequest {
                step: Some("c".to_string()),
                force: true,
                ..RunRequest::default()
            },
            CancellationToken::new(),
        )
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(provider.prompts(), vec!["do c", "do a", "do b"]);
    Ok(())
}

// ===========================================================================
// Interruption and recovery
// ===========================================================================

#[tokio::test]
async fn interrupt_keeps_progress_for_resume() -> Result<()> {
    let project = TestProject::new();
    let provider = Arc::new(
        ScriptedProvider::new("p1").with_replies([Reply::ok("a done"), Reply::Hang]),
    );
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(
        MODE,
        config.clone(),
        linear_catalog(MODE),
        &[Arc::clone(&provider)],
    );

    let cancel = CancellationToken::new();
    let trigger = {
        let provider = Arc::clone(&provider);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            provider.wait_for_calls(2).await;
            cancel.cancel();
        })
    };
    let summary = runner.run(RunRequest::default(), cancel).await?;
    trigger.await?;

    assert_eq!(
        summary.outcome,
        RunOutcome::Interrupted {
            step_id: Some("b".to_string())
        }
    );
    let saved = checkpoint(&project);
    assert_eq!(saved.state, WorkflowState::Running);
    assert_eq!(saved.completed_steps, vec!["a"]);
    assert_eq!(saved.current_step_id.as_deref(), Some("b"));

    // A fresh runner resumes at b without repeating a.
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);
    let resumed = runner.run(RunRequest::default(), CancellationToken::new()).await?;
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    let prompts = provider.prompts();
    assert_eq!(prompts.iter().filter(|p| p.as_str() == "do a").count(), 1);
    assert_eq!(prompts.last().map(String::as_str), Some("do c"));
    Ok(())
}

#[tokio::test]
async fn corrupt_checkpoint_starts_over_with_warning() -> Result<()> {
    let project = TestProject::new();
    let path = project.store_config().checkpoint_path(MODE);
    std::fs::create_dir_all(path.parent().expect("checkpoint has a parent"))?;
    std::fs::write(&path, "{ not json")?;

    let provider = scripted("p1");
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);
    let summary = runner.run(RunRequest::default(), CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("unreadable"));
    assert_eq!(checkpoint(&project).state, WorkflowState::Completed);
    Ok(())
}

// ===========================================================================
// Status and reset
// ===========================================================================

#[tokio::test]
async fn status_and_reset() -> Result<()> {
    let project = TestProject::new();
    let provider = Arc::new(
        ScriptedProvider::new("p1")
            .with_replies([Reply::ok("a done"), Reply::ok("Input needed:\n1. Which port?")]),
    );
    let config = harness_config(vec![provider_config("p1", 0, 3)]);
    let mut runner = project.runner(MODE, config, linear_catalog(MODE), &[Arc::clone(&provider)]);

    let fresh = runner.status();
    assert_eq!(fresh.run.state, WorkflowState::Idle);
    assert_eq!(fresh.total_steps, 3);
    assert_eq!(fresh.next_step.as_deref(), Some("a"));

    runner.run(RunRequest::default(), CancellationToken::new()).await?;
    let paused = runner.status();
    assert_eq!(paused.run.state, WorkflowState::PausedUserFeedback);
    assert_eq!(paused.remaining_steps, 2);
    assert_eq!(paused.next_step.as_deref(), Some("b"));
    assert!(paused.warning.is_none());

    runner.reset()?;
    assert!(matches!(project.store().load(MODE), CheckpointLoad::Missing));
    assert_eq!(runner.status().run.state, WorkflowState::Idle);
    Ok(())
}
