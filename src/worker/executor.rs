//! Runs the commands of one task and reports its lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CommandError, ExecutorError, ListenerError};
use crate::model::{Command, Task};
use crate::worker::state::ExecutionState;

/// Executes a single command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Long-running commands should watch
    /// `cancel` and return [`CommandError::Cancelled`] when it fires.
    async fn run(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        command: &Command,
    ) -> Result<(), CommandError>;
}

/// Receives task lifecycle notifications, typically to relay them to the
/// manager.
#[async_trait]
pub trait TaskExecutionListener: Send + Sync {
    async fn task_started(&self, task_id: Uuid) -> Result<(), ListenerError>;

    /// One more step of the task is done.
    async fn task_step(&self, task_id: Uuid) -> Result<(), ListenerError>;

    async fn task_completed(&self, task_id: Uuid) -> Result<(), ListenerError>;

    async fn task_failed(&self, task_id: Uuid, error: &CommandError) -> Result<(), ListenerError>;

    /// Execution stopped because it was cancelled, not because of an error.
    async fn task_interrupted(&self, task_id: Uuid) -> Result<(), ListenerError>;
}

/// How a task run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(CommandError),
    Interrupted,
}

/// Result of running a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    /// Steps of all commands that finished, counting a self-counting command's
    /// declared steps once it is done.
    pub steps_completed: u32,
}

/// Drives one task through its commands.
pub struct TaskExecutor {
    runner: Arc<dyn CommandRunner>,
    listener: Arc<dyn TaskExecutionListener>,
}

impl TaskExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, listener: Arc<dyn TaskExecutionListener>) -> Self {
        Self { runner, listener }
    }

    /// Run every command of the task in order, stopping at the first failure
    /// or at cancellation (checked between commands).
    ///
    /// A failing command is reported as [`TaskOutcome::Failed`]; only a
    /// listener that cannot be notified makes this return an error.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<TaskReport, ExecutorError> {
        let task_id = task.uuid;
        let mut state = ExecutionState::Idle;
        let mut steps_completed = 0u32;

        transition(&mut state, ExecutionState::Started, task_id);
        self.listener.task_started(task_id).await?;
        info!(task = %task_id, commands = task.commands.len(), "Task started");

        for (index, command) in task.commands.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.interrupt(&mut state, task_id, steps_completed).await;
            }

            transition(&mut state, ExecutionState::Running, task_id);
            debug!(task = %task_id, index, command = %command.name, "Running command");

            match self.runner.run(cancel, task_id, command).await {
                Ok(()) => {}
                Err(CommandError::Cancelled { .. }) => {
                    return self.interrupt(&mut state, task_id, steps_completed).await;
                }
                Err(err) => {
                    transition(&mut state, ExecutionState::Failed, task_id);
                    warn!(task = %task_id, command = %command.name, error = %err, "Command failed");
                    self.listener.task_failed(task_id, &err).await?;
                    return Ok(TaskReport {
                        outcome: TaskOutcome::Failed(err),
                        steps_completed,
                    });
                }
            }

            if command.counts_own_steps() {
                // The runner reported these steps itself.
                steps_completed = steps_completed.saturating_add(command.total_step_count);
            } else {
                steps_completed = steps_completed.saturating_add(1);
                self.listener.task_step(task_id).await?;
            }
        }

        transition(&mut state, ExecutionState::Completed, task_id);
        self.listener.task_completed(task_id).await?;
        info!(task = %task_id, steps_completed, "Task completed");
        Ok(TaskReport {
            outcome: TaskOutcome::Completed,
            steps_completed,
        })
    }

    async fn interrupt(
        &self,
        state: &mut ExecutionState,
        task_id: Uuid,
        steps_completed: u32,
    ) -> Result<TaskReport, ExecutorError> {
        transition(state, ExecutionState::Interrupted, task_id);
        info!(task = %task_id, "Task execution interrupted");
        self.listener.task_interrupted(task_id).await?;
        Ok(TaskReport {
            outcome: TaskOutcome::Interrupted,
            steps_completed,
        })
    }
}

fn transition(state: &mut ExecutionState, to: ExecutionState, task_id: Uuid) {
    debug_assert!(
        state.can_transition_to(to),
        "invalid execution transition {state} -> {to}"
    );
    debug!(task = %task_id, from = %state, to = %to, "Execution state change");
    *state = to;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records runner and listener calls in one shared log.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct MockRunner {
        recorder: Arc<Recorder>,
        fail_on: Option<&'static str>,
        cancel_on: Option<&'static str>,
        report_cancelled_on: Option<&'static str>,
    }

    impl MockRunner {
        fn new(recorder: Arc<Recorder>) -> Self {
            Self {
                recorder,
                fail_on: None,
                cancel_on: None,
                report_cancelled_on: None,
            }
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(
            &self,
            cancel: &CancellationToken,
            _task_id: Uuid,
            command: &Command,
        ) -> Result<(), CommandError> {
            self.recorder.push(format!("run:{}", command.name));
            if self.cancel_on == Some(command.name.as_str()) {
                cancel.cancel();
            }
            if self.report_cancelled_on == Some(command.name.as_str()) {
                return Err(CommandError::Cancelled {
                    name: command.name.clone(),
                });
            }
            if self.fail_on == Some(command.name.as_str()) {
                return Err(CommandError::Failed {
                    name: command.name.clone(),
                    reason: "exit status 1".to_string(),
                });
            }
            Ok(())
        }
    }

    struct MockListener {
        recorder: Arc<Recorder>,
        fail_started: bool,
    }

    #[async_trait]
    impl TaskExecutionListener for MockListener {
        async fn task_started(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            if self.fail_started {
                return Err(ListenerError("manager unreachable".to_string()));
            }
            self.recorder.push("started");
            Ok(())
        }

        async fn task_step(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            self.recorder.push("step");
            Ok(())
        }

        async fn task_completed(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            self.recorder.push("completed");
            Ok(())
        }

        async fn task_failed(&self, _task_id: Uuid, _error: &CommandError) -> Result<(), ListenerError> {
            self.recorder.push("failed");
            Ok(())
        }

        async fn task_interrupted(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            self.recorder.push("interrupted");
            Ok(())
        }
    }

    fn executor(runner: MockRunner, recorder: Arc<Recorder>) -> TaskExecutor {
        TaskExecutor::new(
            Arc::new(runner),
            Arc::new(MockListener {
                recorder,
                fail_started: false,
            }),
        )
    }

    fn task(commands: Vec<Command>) -> Task {
        Task::new(1, "Execution Test", "typie-task").with_commands(commands)
    }

    #[tokio::test]
    async fn self_counting_command_gets_no_extra_step() {
        let recorder = Arc::new(Recorder::default());
        let te = executor(MockRunner::new(recorder.clone()), recorder.clone());
        let task = task(vec![
            Command::new("cmd-without-steps")
                .with_param("message", serde_json::json!("this is a test")),
            Command::new("cmd-with-steps").with_steps(3),
        ]);

        let report = te.run(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Completed);
        assert_eq!(report.steps_completed, task.steps_total());
        assert_eq!(
            recorder.events(),
            vec![
                "started",
                "run:cmd-without-steps",
                "step",
                "run:cmd-with-steps",
                "completed"
            ]
        );
    }

    #[tokio::test]
    async fn first_failure_stops_the_task() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = MockRunner::new(recorder.clone());
        runner.fail_on = Some("two");
        let te = executor(runner, recorder.clone());
        let task = task(vec![Command::new("one"), Command::new("two"), Command::new("three")]);

        let report = te.run(&CancellationToken::new(), &task).await.unwrap();
        assert!(matches!(report.outcome, TaskOutcome::Failed(CommandError::Failed { .. })));
        assert_eq!(report.steps_completed, 1);
        assert_eq!(
            recorder.events(),
            vec!["started", "run:one", "step", "run:two", "failed"]
        );
    }

    #[tokio::test]
    async fn cancellation_between_commands_interrupts() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = MockRunner::new(recorder.clone());
        runner.cancel_on = Some("one");
        let te = executor(runner, recorder.clone());
        let task = task(vec![Command::new("one"), Command::new("two")]);

        let report = te.run(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Interrupted);
        assert_eq!(
            recorder.events(),
            vec!["started", "run:one", "step", "interrupted"]
        );
    }

    #[tokio::test]
    async fn cancelled_command_interrupts_without_step() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = MockRunner::new(recorder.clone());
        runner.report_cancelled_on = Some("one");
        let te = executor(runner, recorder.clone());
        let task = task(vec![Command::new("one"), Command::new("two")]);

        let report = te.run(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Interrupted);
        assert_eq!(report.steps_completed, 0);
        assert_eq!(recorder.events(), vec!["started", "run:one", "interrupted"]);
    }

    #[tokio::test]
    async fn already_cancelled_runs_nothing() {
        let recorder = Arc::new(Recorder::default());
        let te = executor(MockRunner::new(recorder.clone()), recorder.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = te.run(&cancel, &task(vec![Command::new("one")])).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Interrupted);
        assert_eq!(recorder.events(), vec!["started", "interrupted"]);
    }

    #[tokio::test]
    async fn huge_step_counts_saturate() {
        let recorder = Arc::new(Recorder::default());
        let te = executor(MockRunner::new(recorder.clone()), recorder.clone());
        let task = task(vec![
            Command::new("a").with_steps(u32::MAX),
            Command::new("b").with_steps(2),
            Command::new("c"),
        ]);

        let report = te.run(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Completed);
        assert_eq!(report.steps_completed, u32::MAX);
        assert_eq!(task.steps_total(), u32::MAX);
    }

    #[tokio::test]
    async fn empty_task_completes() {
        let recorder = Arc::new(Recorder::default());
        let te = executor(MockRunner::new(recorder.clone()), recorder.clone());

        let report = te.run(&CancellationToken::new(), &task(vec![])).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Completed);
        assert_eq!(recorder.events(), vec!["started", "completed"]);
    }

    #[tokio::test]
    async fn listener_failure_is_an_executor_error() {
        let recorder = Arc::new(Recorder::default());
        let te = TaskExecutor::new(
            Arc::new(MockRunner::new(recorder.clone())),
            Arc::new(MockListener {
                recorder: recorder.clone(),
                fail_started: true,
            }),
        );

        let err = te
            .run(&CancellationToken::new(), &task(vec![Command::new("one")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Notify(_)));
        assert!(recorder.events().is_empty());
    }
}
