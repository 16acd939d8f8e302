use std::ops::{Deref, DerefMut};

use async_trait::async_trait;

use crate::error::Result;

/// One unit of work of a [`Process`](super::Process) with a compensating action.
///
/// Steps share state through the process context `C`. A step that has
/// executed successfully is rolled back, in reverse order, when a later step
/// fails.
#[async_trait]
pub trait ProcessStep<C: Send + 'static>: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn execute(&mut self, ctx: &mut StepContext<'_, C>) -> Result<()>;

    /// Undo the effects of a successful `execute`
    async fn rollback(&mut self, _context: &mut C) -> Result<()> {
        Ok(())
    }
}

/// Execution handle passed to a running step.
///
/// Dereferences to the process context and lets the step schedule new steps
/// directly after itself.
pub struct StepContext<'a, C: Send + 'static> {
    context: &'a mut C,
    inserted: &'a mut Vec<Box<dyn ProcessStep<C>>>,
    process_name: &'a str,
}

impl<'a, C: Send + 'static> StepContext<'a, C> {
    pub(crate) fn new(
        context: &'a mut C,
        inserted: &'a mut Vec<Box<dyn ProcessStep<C>>>,
        process_name: &'a str,
    ) -> Self {
        Self {
            context,
            inserted,
            process_name,
        }
    }

    /// Schedule `step` to run after the current step.
    ///
    /// Steps inserted during one execution keep their insertion order and run
    /// before any step that was already queued behind the current one.
    pub fn insert_next<S>(&mut self, step: S)
    where
        S: ProcessStep<C> + 'static,
    {
        self.inserted.push(Box::new(step));
    }

    pub fn process_name(&self) -> &str {
        self.process_name
    }
}

impl<C: Send + 'static> Deref for StepContext<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.context
    }
}

impl<C: Send + 'static> DerefMut for StepContext<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.context
    }
}
