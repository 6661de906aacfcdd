//! Command registry: the worker's built-in command implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CommandError;
use crate::model::Command;
use crate::worker::executor::{CommandRunner, TaskExecutionListener};

/// Everything a handler may use while running one command.
pub struct CommandContext<'a> {
    pub task_id: Uuid,
    pub cancel: &'a CancellationToken,
    listener: Option<&'a Arc<dyn TaskExecutionListener>>,
}

impl CommandContext<'_> {
    /// Report one finished step of a self-counting command.
    pub async fn report_step(&self, command: &Command) -> Result<(), CommandError> {
        let Some(listener) = self.listener else {
            return Ok(());
        };
        listener
            .task_step(self.task_id)
            .await
            .map_err(|e| CommandError::Failed {
                name: command.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// Implementation of one named command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &CommandContext<'_>, command: &Command) -> Result<(), CommandError>;
}

/// Name to handler map, usable as the executor's [`CommandRunner`].
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    listener: Option<Arc<dyn TaskExecutionListener>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            listener: None,
        }
    }

    /// Registry with `echo` and `sleep`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoCommand));
        registry.register(Arc::new(SleepCommand));
        registry
    }

    /// Listener that receives the steps of self-counting commands.
    pub fn with_listener(mut self, listener: Arc<dyn TaskExecutionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register a handler, replacing any handler of the same name.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(command = %name, "Replaced existing command handler");
        } else {
            debug!("Registered command: {}", name);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[async_trait]
impl CommandRunner for CommandRegistry {
    async fn run(
        &self,
        cancel: &CancellationToken,
        task_id: Uuid,
        command: &Command,
    ) -> Result<(), CommandError> {
        let handler = self
            .handlers
            .get(&command.name)
            .ok_or_else(|| CommandError::UnknownCommand {
                name: command.name.clone(),
            })?;
        let ctx = CommandContext {
            task_id,
            cancel,
            listener: self.listener.as_ref(),
        };
        handler.execute(&ctx, command).await
    }
}

fn invalid(command: &Command, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidParameters {
        name: command.name.clone(),
        reason: reason.into(),
    }
}

/// Logs its `message` parameter.
pub struct EchoCommand;

#[async_trait]
impl CommandHandler for EchoCommand {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &CommandContext<'_>, command: &Command) -> Result<(), CommandError> {
        let message = command
            .parameters
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid(command, "missing 'message' string"))?;
        info!(task = %ctx.task_id, message, "echo");
        Ok(())
    }
}

/// Waits `duration_in_seconds`. With a declared step count the wait is split
/// into that many steps, each reported as it finishes.
pub struct SleepCommand;

#[async_trait]
impl CommandHandler for SleepCommand {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, ctx: &CommandContext<'_>, command: &Command) -> Result<(), CommandError> {
        let seconds = command
            .parameters
            .get("duration_in_seconds")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| invalid(command, "missing 'duration_in_seconds' number"))?;
        let total = Duration::try_from_secs_f64(seconds)
            .map_err(|e| invalid(command, format!("duration {seconds}: {e}")))?;
        debug!(task = %ctx.task_id, seconds, "Sleeping");

        let steps = command.total_step_count.max(1);
        let slice = total / steps;
        for _ in 0..steps {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(CommandError::Cancelled { name: command.name.clone() });
                }
                _ = tokio::time::sleep(slice) => {}
            }
            if command.counts_own_steps() {
                ctx.report_step(command).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ListenerError;

    #[derive(Default)]
    struct StepCounter {
        steps: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutionListener for StepCounter {
        async fn task_started(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            Ok(())
        }
        async fn task_step(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn task_completed(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            Ok(())
        }
        async fn task_failed(&self, _task_id: Uuid, _error: &CommandError) -> Result<(), ListenerError> {
            Ok(())
        }
        async fn task_interrupted(&self, _task_id: Uuid) -> Result<(), ListenerError> {
            Ok(())
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.has("echo"));
        assert!(registry.has("sleep"));
        assert_eq!(registry.list(), vec!["echo", "sleep"]);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let registry = CommandRegistry::with_builtins();
        let err = registry
            .run(&CancellationToken::new(), Uuid::new_v4(), &Command::new("blender-render"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::UnknownCommand {
                name: "blender-render".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_echo_requires_message() {
        let registry = CommandRegistry::with_builtins();
        let cancel = CancellationToken::new();

        let ok = Command::new("echo").with_param("message", serde_json::json!("hello"));
        registry.run(&cancel, Uuid::new_v4(), &ok).await.unwrap();

        let err = registry
            .run(&cancel, Uuid::new_v4(), &Command::new("echo"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidParameters { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_reports_own_steps() {
        let counter = Arc::new(StepCounter::default());
        let registry = CommandRegistry::with_builtins().with_listener(counter.clone());
        let command = Command::new("sleep")
            .with_param("duration_in_seconds", serde_json::json!(3))
            .with_steps(3);

        registry
            .run(&CancellationToken::new(), Uuid::new_v4(), &command)
            .await
            .unwrap();
        assert_eq!(counter.steps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coarse_sleep_reports_nothing() {
        let counter = Arc::new(StepCounter::default());
        let registry = CommandRegistry::with_builtins().with_listener(counter.clone());
        let command = Command::new("sleep").with_param("duration_in_seconds", serde_json::json!(1.5));

        registry
            .run(&CancellationToken::new(), Uuid::new_v4(), &command)
            .await
            .unwrap();
        assert_eq!(counter.steps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sleep_is_cancellable() {
        let registry = CommandRegistry::with_builtins();
        let cancel = CancellationToken::new();
        let command = Command::new("sleep").with_param("duration_in_seconds", serde_json::json!(3600));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            registry.run(&cancel, Uuid::new_v4(), &command),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_sleep_rejects_unrepresentable_duration() {
        let registry = CommandRegistry::with_builtins();
        for seconds in [serde_json::json!(-1), serde_json::json!(1e30)] {
            let command = Command::new("sleep").with_param("duration_in_seconds", seconds);
            let err = registry
                .run(&CancellationToken::new(), Uuid::new_v4(), &command)
                .await
                .unwrap_err();
            assert!(matches!(err, CommandError::InvalidParameters { .. }), "got {err:?}");
        }
    }
}
