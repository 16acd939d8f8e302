use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProcessError, Result, SyncError};
use crate::process::step::{ProcessStep, StepContext};

/// Lifecycle of a [`Process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    RollingBack,
    Succeeded,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Succeeded | ProcessState::Failed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Created => "CREATED",
            ProcessState::Running => "RUNNING",
            ProcessState::RollingBack => "ROLLING_BACK",
            ProcessState::Succeeded => "SUCCEEDED",
            ProcessState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Observer notified once when a process reaches a terminal state
pub trait ProcessListener: Send + Sync {
    fn on_succeeded(&self, process: &str);

    fn on_failed(&self, process: &str, error: &SyncError);
}

/// Listener that only logs terminal outcomes
#[derive(Debug, Default)]
pub struct LoggingListener;

impl ProcessListener for LoggingListener {
    fn on_succeeded(&self, process: &str) {
        info!(process, "Process succeeded");
    }

    fn on_failed(&self, process: &str, error: &SyncError) {
        error!(process, kind = ?error.kind(), "Process failed: {}", error);
    }
}

/// Ordered, dynamically extensible sequence of steps with rollback.
///
/// Steps run one after another on the task driving the process. The cursor
/// only moves forward; steps below it have executed successfully and are
/// compensated in reverse order if a later step fails.
pub struct Process<C: Send + 'static> {
    name: String,
    context: C,
    steps: Vec<Box<dyn ProcessStep<C>>>,
    cursor: usize,
    state: ProcessState,
    listeners: Vec<Arc<dyn ProcessListener>>,
}

impl<C: Send + 'static> Process<C> {
    pub fn new(name: impl Into<String>, context: C) -> Self {
        Self {
            name: name.into(),
            context,
            steps: Vec::new(),
            cursor: 0,
            state: ProcessState::Created,
            listeners: Vec::new(),
        }
    }

    /// Builder-style variant of [`Process::add_step`] for fresh processes
    pub fn with_step<S>(mut self, step: S) -> Self
    where
        S: ProcessStep<C> + 'static,
    {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a step; only allowed before the process is started
    pub fn add_step<S>(&mut self, step: S) -> Result<()>
    where
        S: ProcessStep<C> + 'static,
    {
        self.ensure_created("add_step")?;
        self.steps.push(Box::new(step));
        Ok(())
    }

    /// Register a terminal-state observer; only allowed before start
    pub fn add_listener(&mut self, listener: Arc<dyn ProcessListener>) -> Result<()> {
        self.ensure_created("add_listener")?;
        self.listeners.push(listener);
        Ok(())
    }

    /// Builder-style variant of [`Process::add_listener`] for fresh processes
    pub fn with_listener(mut self, listener: Arc<dyn ProcessListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Index of the next step to execute
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    /// Run all steps to a terminal state.
    ///
    /// Returns the error of the failing step after rollback has completed.
    /// Starting a process twice is a contract violation and leaves the
    /// process untouched.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_created("start")?;
        self.state = ProcessState::Running;
        info!(process = %self.name, steps = self.steps.len(), "Starting process");

        while self.cursor < self.steps.len() {
            let mut inserted: Vec<Box<dyn ProcessStep<C>>> = Vec::new();
            let step = &mut self.steps[self.cursor];
            debug!(process = %self.name, step = step.name(), index = self.cursor, "Executing step");

            let result = {
                let mut ctx = StepContext::new(&mut self.context, &mut inserted, &self.name);
                step.execute(&mut ctx).await
            };

            match result {
                Ok(()) => {
                    if !inserted.is_empty() {
                        let at = self.cursor + 1;
                        debug!(process = %self.name, count = inserted.len(), at, "Inserting steps");
                        self.steps.splice(at..at, inserted);
                    }
                    self.cursor += 1;
                }
                Err(err) => {
                    warn!(
                        process = %self.name,
                        step = self.steps[self.cursor].name(),
                        "Step failed: {}",
                        err
                    );
                    self.rollback().await;
                    self.finish(Err(err.clone()));
                    return Err(err);
                }
            }
        }

        self.finish(Ok(()));
        Ok(())
    }

    /// Start and hand back the context on success
    pub async fn execute(mut self) -> Result<C> {
        self.start().await?;
        Ok(self.context)
    }

    /// Run the process on its own tokio task
    pub fn spawn(self) -> ProcessHandle<C> {
        let name = self.name.clone();
        ProcessHandle {
            name,
            handle: tokio::spawn(self.execute()),
        }
    }

    async fn rollback(&mut self) {
        self.state = ProcessState::RollingBack;
        info!(process = %self.name, executed = self.cursor, "Rolling back process");

        for index in (0..self.cursor).rev() {
            let step = &mut self.steps[index];
            if let Err(err) = step.rollback(&mut self.context).await {
                // best effort: keep unwinding
                warn!(process = %self.name, step = step.name(), "Rollback failed: {}", err);
            }
        }
    }

    fn finish(&mut self, outcome: std::result::Result<(), SyncError>) {
        match outcome {
            Ok(()) => {
                self.state = ProcessState::Succeeded;
                info!(process = %self.name, "Process succeeded");
                for listener in &self.listeners {
                    listener.on_succeeded(&self.name);
                }
            }
            Err(err) => {
                self.state = ProcessState::Failed;
                for listener in &self.listeners {
                    listener.on_failed(&self.name, &err);
                }
            }
        }
    }

    fn ensure_created(&self, operation: &str) -> Result<()> {
        if self.state != ProcessState::Created {
            return Err(SyncError::invalid_state(
                operation,
                ProcessState::Created,
                self.state,
            ));
        }
        Ok(())
    }
}

impl<C: Send + 'static> fmt::Debug for Process<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Handle of a process running on its own task
pub struct ProcessHandle<C> {
    name: String,
    handle: JoinHandle<Result<C>>,
}

impl<C> ProcessHandle<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the terminal outcome
    pub async fn join(self) -> Result<C> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ProcessError::Interrupted {
                name: self.name,
                reason: e.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        events: Vec<String>,
    }

    struct Record {
        name: String,
        fail: bool,
        fail_rollback: bool,
    }

    impl Record {
        fn ok(name: &str) -> Self {
            Self { name: name.to_string(), fail: false, fail_rollback: false }
        }

        fn failing(name: &str) -> Self {
            Self { name: name.to_string(), fail: true, fail_rollback: false }
        }
    }

    #[async_trait]
    impl ProcessStep<Journal> for Record {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&mut self, ctx: &mut StepContext<'_, Journal>) -> Result<()> {
            if self.fail {
                return Err(TransportError::ChannelClosed.into());
            }
            ctx.events.push(format!("exec:{}", self.name));
            Ok(())
        }

        async fn rollback(&mut self, context: &mut Journal) -> Result<()> {
            context.events.push(format!("undo:{}", self.name));
            if self.fail_rollback {
                return Err(SyncError::Crypto("rollback broke".to_string()));
            }
            Ok(())
        }
    }

    /// Inserts two steps after itself the first time it runs
    struct Expand;

    #[async_trait]
    impl ProcessStep<Journal> for Expand {
        fn name(&self) -> &str {
            "expand"
        }

        async fn execute(&mut self, ctx: &mut StepContext<'_, Journal>) -> Result<()> {
            ctx.events.push("exec:expand".to_string());
            ctx.insert_next(Record::ok("child-1"));
            ctx.insert_next(Record::ok("child-2"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingListener {
        outcomes: Mutex<Vec<std::result::Result<(), ErrorKind>>>,
    }

    impl ProcessListener for CountingListener {
        fn on_succeeded(&self, _process: &str) {
            self.outcomes.lock().unwrap().push(Ok(()));
        }

        fn on_failed(&self, _process: &str, error: &SyncError) {
            self.outcomes.lock().unwrap().push(Err(error.kind()));
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let listener = Arc::new(CountingListener::default());
        let mut process = Process::new("ordered", Journal::default())
            .with_step(Record::ok("a"))
            .with_step(Record::ok("b"));
        process.add_listener(listener.clone()).unwrap();

        process.start().await.unwrap();

        assert_eq!(process.state(), ProcessState::Succeeded);
        assert_eq!(process.context().events, vec!["exec:a", "exec:b"]);
        assert_eq!(*listener.outcomes.lock().unwrap(), vec![Ok(())]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_in_reverse() {
        let listener = Arc::new(CountingListener::default());
        let mut process = Process::new("rollback", Journal::default())
            .with_step(Record::ok("a"))
            .with_step(Record::ok("b"))
            .with_step(Record::failing("c"))
            .with_step(Record::ok("d"));
        process.add_listener(listener.clone()).unwrap();

        let err = process.start().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(process.state(), ProcessState::Failed);
        assert_eq!(
            process.context().events,
            vec!["exec:a", "exec:b", "undo:b", "undo:a"]
        );
        assert_eq!(
            *listener.outcomes.lock().unwrap(),
            vec![Err(ErrorKind::Transport)]
        );
    }

    #[tokio::test]
    async fn test_rollback_errors_do_not_stop_unwind() {
        let mut broken = Record::ok("b");
        broken.fail_rollback = true;
        let mut process = Process::new("best-effort", Journal::default())
            .with_step(Record::ok("a"))
            .with_step(broken)
            .with_step(Record::failing("c"));

        assert!(process.start().await.is_err());
        assert_eq!(
            process.context().events,
            vec!["exec:a", "exec:b", "undo:b", "undo:a"]
        );
    }

    #[tokio::test]
    async fn test_inserted_steps_run_after_current() {
        let mut process = Process::new("dynamic", Journal::default())
            .with_step(Record::ok("first"))
            .with_step(Expand)
            .with_step(Record::ok("last"));

        process.start().await.unwrap();

        assert_eq!(
            process.context().events,
            vec!["exec:first", "exec:expand", "exec:child-1", "exec:child-2", "exec:last"]
        );
        assert_eq!(
            process.step_names(),
            vec!["first", "expand", "child-1", "child-2", "last"]
        );
        assert_eq!(process.cursor(), 5);
    }

    #[tokio::test]
    async fn test_inserted_steps_are_rolled_back() {
        let mut process = Process::new("dynamic-rollback", Journal::default())
            .with_step(Expand)
            .with_step(Record::failing("boom"));

        assert!(process.start().await.is_err());
        assert_eq!(
            process.context().events,
            vec![
                "exec:expand",
                "exec:child-1",
                "exec:child-2",
                "undo:child-2",
                "undo:child-1"
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let listener = Arc::new(CountingListener::default());
        let mut process = Process::new("once", Journal::default()).with_step(Record::ok("a"));
        process.add_listener(listener.clone()).unwrap();
        process.start().await.unwrap();

        let err = process.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(process.add_step(Record::ok("late")).is_err());
        assert!(process.add_listener(Arc::new(LoggingListener)).is_err());
        assert_eq!(process.state(), ProcessState::Succeeded);
        assert_eq!(listener.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_processes_run_independently() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                Process::new(format!("p{}", i), Journal::default())
                    .with_step(Record::ok(&format!("step-{}", i)))
                    .spawn()
            })
            .collect();

        for handle in handles {
            let journal = handle.join().await.unwrap();
            assert_eq!(journal.events.len(), 1);
        }
    }
}
