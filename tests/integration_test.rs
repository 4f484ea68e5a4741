//! Integration tests for TaskPilot
//!
//! End-to-end runs of the engine against the scripted tool double.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use taskpilot::budget::EnforcementMode;
use taskpilot::checkpoint::CheckpointStore;
use taskpilot::config::Config;
use taskpilot::domain::{Checkpoint, ErrorKind, Priority, Task, TaskStatus};
use taskpilot::engine::Engine;
use taskpilot::events::{CaptureSink, EventSink, NullSink};
use taskpilot::planner::RunOutcome;
use taskpilot::progress::NullProgress;
use taskpilot::store::TaskStore;
use taskpilot::tool::scripted::Scripted;
use taskpilot::tool::{ScriptedTool, ToolError, ToolOutput};

fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.store.dir = root.join("store");
    config.checkpoint.root = root.join("checkpoints");
    config.tool.workdir = root.to_path_buf();
    config.max_workers = 1;
    config.worker_timeout_secs = 5;
    config.shutdown_grace_secs = 5;
    config.review_depth = 0;
    // Immediate retries keep the tests fast
    config.retry.base_delay_secs = 0;
    config.retry.max_delay_secs = 0;
    config
}

async fn seed_tasks(dir: &std::path::Path, tasks: Vec<Task>) {
    let store = TaskStore::open(dir, Arc::new(NullProgress)).unwrap();
    for task in tasks {
        store.insert(task).await.unwrap();
    }
    store.shutdown().await.unwrap();
}

async fn run_engine(config: Config, tool: Arc<ScriptedTool>, events: Arc<dyn EventSink>) -> taskpilot::RunReport {
    let engine = Engine::new(config, tool, events, Arc::new(NullProgress));
    engine.run(CancellationToken::new()).await.unwrap()
}

async fn final_tasks(dir: &std::path::Path) -> Vec<Task> {
    let store = TaskStore::open(dir, Arc::new(NullProgress)).unwrap();
    let tasks = store.list_all().await.unwrap();
    store.shutdown().await.unwrap();
    tasks
}

fn status_of<'a>(tasks: &'a [Task], id: &str) -> &'a Task {
    tasks.iter().find(|t| t.id == id).unwrap()
}

// =============================================================================
// Scenario: diamond dependency
// =============================================================================

#[tokio::test]
async fn test_diamond_dependency_sequential_order() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("A", "a", "a").with_created_at(1),
            Task::new("B", "b", "b").with_dep("A").with_created_at(2),
            Task::new("C", "c", "c").with_dep("A").with_created_at(3),
            Task::new("D", "d", "d").with_dep("B").with_dep("C").with_created_at(4),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    for id in ["A", "B", "C", "D"] {
        tool.script_success(id, 10);
    }

    let report = run_engine(config.clone(), tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    // Exactly one dispatch of each, in topological order
    assert_eq!(tool.invocations(), vec!["A", "B", "C", "D"]);
    for task in &report.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 1);
    }
}

#[tokio::test]
async fn test_priority_orders_independent_tasks() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("slow", "s", "s").with_priority(Priority::Low).with_created_at(1),
            Task::new("urgent", "u", "u").with_priority(Priority::High).with_created_at(2),
            Task::new("normal", "n", "n").with_priority(Priority::Medium).with_created_at(3),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    for id in ["slow", "urgent", "normal"] {
        tool.script_success(id, 10);
    }

    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(tool.invocations(), vec!["urgent", "normal", "slow"]);
}

// =============================================================================
// Scenario: permanent failure blocks dependent
// =============================================================================

#[tokio::test]
async fn test_exhausted_retries_block_dependent() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("X", "x", "x").with_created_at(1),
            Task::new("Y", "y", "y").with_dep("X").with_created_at(2),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    // X claims a file that never exists, so every attempt fails validation
    tool.script(
        "X",
        Scripted::Ok(ToolOutput {
            text: "wrote the file".to_string(),
            created_files: vec!["never-written.rs".to_string()],
            tokens_used: 5,
            ..Default::default()
        }),
    );

    let report = run_engine(config.clone(), tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::TasksFailed);

    let x = status_of(&report.tasks, "X");
    assert_eq!(x.status, TaskStatus::Failed);
    assert_eq!(x.attempts, config.retry.max_retries + 1);
    assert_eq!(x.last_error.as_ref().unwrap().kind, ErrorKind::Validation);

    // Y was blocked without ever being dispatched
    let y = status_of(&report.tasks, "Y");
    assert_eq!(y.status, TaskStatus::Blocked);
    assert_eq!(y.attempts, 0);
    assert_eq!(tool.invocation_count("Y"), 0);
    assert_eq!(tool.invocation_count("X"), (config.retry.max_retries + 1) as usize);
}

#[tokio::test]
async fn test_protocol_errors_bounded_to_two_attempts() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(&config.store.dir, vec![Task::new("t-1", "x", "y")]).await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script("t-1", Scripted::Err(ToolError::Protocol("no header".to_string())));

    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::TasksFailed);
    let task = status_of(&report.tasks, "t-1");
    assert_eq!(task.attempts, 2);
    assert_eq!(task.last_error.as_ref().unwrap().kind, ErrorKind::Protocol);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(&config.store.dir, vec![Task::new("t-1", "x", "y")]).await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script(
        "t-1",
        Scripted::Err(ToolError::Failed {
            code: 1,
            stderr: "rate limited".to_string(),
        }),
    );
    tool.script_success("t-1", 42);

    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    let task = status_of(&report.tasks, "t-1");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 2);
}

// =============================================================================
// Scenario: circuit breaker trips and recovers
// =============================================================================

#[tokio::test]
async fn test_breaker_trips_then_recovers_after_cooldown() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.breaker.failure_threshold = 2;
    config.breaker.open_cooldown_secs = 1;
    config.breaker.max_cooldown_secs = 4;
    config.retry.max_retries = 5;

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("t-1", "a", "a").with_created_at(1),
            Task::new("t-2", "b", "b").with_created_at(2),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    // Two transient failures trip the single executor's breaker, then
    // everything succeeds once the cooldown passes
    tool.script(
        "t-1",
        Scripted::Err(ToolError::Failed {
            code: 1,
            stderr: "flaky".to_string(),
        }),
    );
    tool.script_success("t-1", 10);
    tool.script(
        "t-2",
        Scripted::Err(ToolError::Failed {
            code: 1,
            stderr: "flaky".to_string(),
        }),
    );
    tool.script_success("t-2", 10);

    let started = std::time::Instant::now();
    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    for task in &report.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
    }
    // The open breaker held the executor through at least one cooldown
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_transient_burst_completes_across_pool() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.max_workers = 3;
    config.breaker.failure_threshold = 5;
    config.breaker.open_cooldown_secs = 1;

    let mut tasks = Vec::new();
    let tool = Arc::new(ScriptedTool::new());
    for i in 0..10i64 {
        let id = format!("t-{}", i);
        tasks.push(Task::new(&id, &id, &id).with_created_at(i));
        if i < 5 {
            // First dispatch of the early tasks fails transiently
            tool.script(
                &id,
                Scripted::Err(ToolError::Failed {
                    code: 1,
                    stderr: "flaky".to_string(),
                }),
            );
        }
        tool.script_success(&id, 10);
    }
    seed_tasks(&config.store.dir, tasks).await;

    let report = run_engine(config, tool, Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.tasks.len(), 10);
    for task in &report.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.attempts <= 2);
    }
}

// =============================================================================
// Scenario: resume after crash
// =============================================================================

/// Seed a store that looks like a crashed run: one task completed, one
/// mid-execution, one untouched.
async fn seed_crashed_run(config: &Config) {
    let store = TaskStore::open(&config.store.dir, Arc::new(NullProgress)).unwrap();

    let mut done = Task::new("done", "done", "done").with_created_at(1);
    done.set_status(TaskStatus::Completed);
    done.set_result(Default::default());
    store.insert(done).await.unwrap();

    store.insert(Task::new("inflight", "inflight", "inflight").with_created_at(2)).await.unwrap();
    store
        .transition("inflight", TaskStatus::Pending, TaskStatus::Ready, None)
        .await
        .unwrap();
    store
        .transition("inflight", TaskStatus::Ready, TaskStatus::Running, None)
        .await
        .unwrap();

    store.insert(Task::new("untouched", "untouched", "untouched").with_created_at(3)).await.unwrap();

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_with_fresh_checkpoint_reruns_task() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    seed_crashed_run(&config).await;

    // The crashed run left an active checkpoint behind
    let checkpoints = CheckpointStore::open(&config.checkpoint.root).unwrap();
    let cp = Checkpoint::new("inflight", 1, "tool invocation");
    checkpoints.create(&cp).unwrap();
    checkpoints.activate(&cp.id).unwrap();

    let tool = Arc::new(ScriptedTool::new());
    tool.script_success("inflight", 10);
    tool.script_success("untouched", 10);

    let events = Arc::new(CaptureSink::new());
    let report = run_engine(config, tool.clone(), events.clone()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(events.count_of("TaskRestored"), 1);

    // The completed task was not re-run
    assert_eq!(tool.invocation_count("done"), 0);
    assert_eq!(tool.invocation_count("inflight"), 1);
    assert_eq!(tool.invocation_count("untouched"), 1);
}

#[tokio::test]
async fn test_resume_with_stale_checkpoint_fails_task() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    seed_crashed_run(&config).await;

    let checkpoints = CheckpointStore::open(&config.checkpoint.root).unwrap();
    let mut cp = Checkpoint::new("inflight", 1, "tool invocation");
    let day_ms = 24 * 60 * 60 * 1000;
    cp.created_at -= 2 * day_ms;
    cp.updated_at -= 2 * day_ms;
    cp.reseal();
    checkpoints.create(&cp).unwrap();

    let tool = Arc::new(ScriptedTool::new());
    tool.script_success("untouched", 10);

    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::TasksFailed);

    let inflight = status_of(&report.tasks, "inflight");
    assert_eq!(inflight.status, TaskStatus::Failed);
    assert_eq!(inflight.last_error.as_ref().unwrap().kind, ErrorKind::StaleCheckpoint);
    assert_eq!(tool.invocation_count("inflight"), 0);

    // The others were unaffected
    assert_eq!(status_of(&report.tasks, "done").status, TaskStatus::Completed);
    assert_eq!(status_of(&report.tasks, "untouched").status, TaskStatus::Completed);
}

// =============================================================================
// Scenario: budget exhaustion
// =============================================================================

#[tokio::test]
async fn test_strict_budget_exhaustion_stops_dispatch() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.budget.total_limit = 1000;
    config.budget.per_task_limit = 600;
    config.budget.enforcement_mode = EnforcementMode::Strict;

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("t-1", "first", "first").with_created_at(1),
            Task::new("t-2", "second", "second").with_created_at(2),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script_success("t-1", 600);
    tool.script_success("t-2", 600);

    let events = Arc::new(CaptureSink::new());
    let report = run_engine(config, tool.clone(), events.clone()).await;

    assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(report.outcome.exit_code(), 3);
    assert_eq!(report.tokens_used, 600);

    assert_eq!(status_of(&report.tasks, "t-1").status, TaskStatus::Completed);
    // The refused task is still ready, never failed
    assert_eq!(status_of(&report.tasks, "t-2").status, TaskStatus::Ready);
    assert_eq!(events.count_of("BudgetExhausted"), 1);
}

#[tokio::test]
async fn test_soft_budget_allows_overrun_with_warning() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.budget.total_limit = 1000;
    config.budget.per_task_limit = 600;
    config.budget.enforcement_mode = EnforcementMode::Soft;

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("t-1", "first", "first").with_created_at(1),
            Task::new("t-2", "second", "second").with_created_at(2),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script_success("t-1", 600);
    tool.script_success("t-2", 600);

    let events = Arc::new(CaptureSink::new());
    let report = run_engine(config, tool, events.clone()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.tokens_used, 1200);
    assert_eq!(events.count_of("BudgetWarning"), 1);
}

// =============================================================================
// Scenario: cycle detection
// =============================================================================

#[tokio::test]
async fn test_cycle_members_fail_without_dispatch() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("P", "p", "p").with_dep("Q").with_created_at(1),
            Task::new("Q", "q", "q").with_dep("P").with_created_at(2),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::TasksFailed);
    assert_eq!(report.outcome.exit_code(), 2);
    assert!(tool.invocations().is_empty());

    for id in ["P", "Q"] {
        let task = status_of(&report.tasks, id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_ref().unwrap().kind, ErrorKind::DependencyCycle);
        assert_eq!(task.attempts, 0);
    }
}

#[tokio::test]
async fn test_planning_continues_around_cycle() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());

    seed_tasks(
        &config.store.dir,
        vec![
            Task::new("P", "p", "p").with_dep("Q").with_created_at(1),
            Task::new("Q", "q", "q").with_dep("P").with_created_at(2),
            Task::new("free", "f", "f").with_created_at(3),
            Task::new("downstream", "d", "d").with_dep("P").with_created_at(4),
        ],
    )
    .await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script_success("free", 10);

    let report = run_engine(config, tool.clone(), Arc::new(NullSink)).await;

    assert_eq!(report.outcome, RunOutcome::TasksFailed);
    assert_eq!(status_of(&report.tasks, "free").status, TaskStatus::Completed);
    assert_eq!(status_of(&report.tasks, "downstream").status, TaskStatus::Blocked);
    assert_eq!(tool.invocations(), vec!["free"]);
}

// =============================================================================
// Review pass
// =============================================================================

#[tokio::test]
async fn test_review_pass_appends_and_runs_new_tasks() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.review_depth = 2;

    seed_tasks(&config.store.dir, vec![Task::new("t-1", "seed", "seed")]).await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script_success("t-1", 10);
    tool.script_success("t-2", 10);
    // First review emits a follow-up, second is quiet
    tool.script(
        "review",
        Scripted::Ok(ToolOutput {
            tokens_used: 20,
            new_tasks: vec![taskpilot::tool::NewTask {
                id: "t-2".to_string(),
                title: "follow up".to_string(),
                description: "emitted by review".to_string(),
                priority: Priority::Medium,
                deps: vec!["t-1".to_string()],
            }],
            ..Default::default()
        }),
    );
    tool.script(
        "review",
        Scripted::Ok(ToolOutput {
            tokens_used: 20,
            ..Default::default()
        }),
    );

    let events = Arc::new(CaptureSink::new());
    let report = run_engine(config, tool.clone(), events.clone()).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.tasks.len(), 2);
    assert_eq!(status_of(&report.tasks, "t-2").status, TaskStatus::Completed);
    assert_eq!(tool.invocation_count("review"), 2);
    assert_eq!(events.count_of("ReviewEmitted"), 1);
    // Review tokens are accounted too
    assert_eq!(report.tokens_used, 60);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancellation_returns_task_to_ready() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    seed_tasks(&config.store.dir, vec![Task::new("t-1", "x", "y")]).await;

    let tool = Arc::new(ScriptedTool::new());
    tool.script("t-1", Scripted::SlowOk(Duration::from_secs(30), ToolOutput::default()));

    let engine = Engine::new(config.clone(), tool, Arc::new(NullSink), Arc::new(NullProgress));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let report = engine.run(cancel).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.outcome.exit_code(), 130);
    assert_eq!(status_of(&report.tasks, "t-1").status, TaskStatus::Ready);

    // The restore left a resumable checkpoint behind
    let checkpoints = CheckpointStore::open(&config.checkpoint.root).unwrap();
    let latest = checkpoints.latest("t-1").unwrap().unwrap();
    assert_eq!(latest.state, taskpilot::domain::CheckpointState::Restored);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_full_queue_blocks_submission() {
    use taskpilot::budget::{BudgetConfig, BudgetGovernor};
    use taskpilot::pool::{ExecutorPool, PoolConfig};
    use taskpilot::tool::ToolClient;

    let temp = TempDir::new().unwrap();
    let store = TaskStore::open(temp.path().join("store"), Arc::new(NullProgress)).unwrap();
    let checkpoints = Arc::new(CheckpointStore::open(temp.path().join("checkpoints")).unwrap());
    let budget = Arc::new(BudgetGovernor::new(BudgetConfig::default()));
    let tool = Arc::new(ScriptedTool::new());

    for i in 0..4 {
        let id = format!("t-{}", i);
        store.insert(Task::new(&id, &id, &id)).await.unwrap();
        store
            .transition(&id, TaskStatus::Pending, TaskStatus::Ready, None)
            .await
            .unwrap();
        tool.script(&id, Scripted::SlowOk(Duration::from_secs(30), ToolOutput::default()));
    }

    let (pool, _reports) = ExecutorPool::spawn(
        PoolConfig {
            max_workers: 1,
            worker_timeout: Duration::from_secs(60),
            workdir: temp.path().to_path_buf(),
            ..Default::default()
        },
        store.clone(),
        checkpoints,
        budget,
        tool as Arc<dyn ToolClient>,
        Arc::new(NullSink),
        CancellationToken::new(),
    );

    // Worker takes t-0; t-1 and t-2 fill the queue (capacity 2)
    pool.submit("t-0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.submit("t-1").await.unwrap();
    pool.submit("t-2").await.unwrap();

    // The fourth submission blocks rather than dropping
    let blocked = tokio::time::timeout(Duration::from_millis(300), pool.submit("t-3")).await;
    assert!(blocked.is_err(), "submission should block while the queue is full");

    pool.shutdown(Duration::from_secs(5)).await;
}
