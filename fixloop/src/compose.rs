//! Sequential and concurrent composition of executions.

use async_trait::async_trait;
use futures::future;
use tracing::{debug, instrument};

use crate::agents::{AgentSpec, BuildError};
use crate::core::types::{ExecutionFailure, ExecutionResult};
use crate::execute::Runtime;
use crate::io::transport::Transport;

/// Anything that can be run against a runtime to produce an [`ExecutionResult`].
///
/// Single agents are wrapped with [`step`]; pipelines are built with
/// [`Sequence::new`] or [`Executable::then`].
#[async_trait]
pub trait Executable: Send + Sync {
    type Input: Send + Sync;
    type Output: Send + Sync;

    fn name(&self) -> &str;

    async fn run<T: Transport>(
        &self,
        runtime: &Runtime<T>,
        input: &Self::Input,
    ) -> Result<ExecutionResult<Self::Output>, BuildError>;

    /// Feed this executable's output into `next`.
    fn then<B>(self, next: B) -> Sequence<Self, B>
    where
        Self: Sized,
        B: Executable<Input = Self::Output>,
    {
        Sequence::new(self, next)
    }
}

/// A single agent as an [`Executable`].
#[derive(Debug, Clone)]
pub struct AgentStep<A>(pub A);

pub fn step<A: AgentSpec>(agent: A) -> AgentStep<A> {
    AgentStep(agent)
}

#[async_trait]
impl<A> Executable for AgentStep<A>
where
    A: AgentSpec,
    A::Output: Sync,
{
    type Input = A::Input;
    type Output = A::Output;

    fn name(&self) -> &str {
        self.0.name()
    }

    async fn run<T: Transport>(
        &self,
        runtime: &Runtime<T>,
        input: &A::Input,
    ) -> Result<ExecutionResult<A::Output>, BuildError> {
        runtime.execute(&self.0, input).await
    }
}

/// Runs `first`, then `second` on its output. Named `first>>second`.
///
/// Stops at the first failure. Attempt counts of both stages are added up.
#[derive(Debug, Clone)]
pub struct Sequence<A, B> {
    name: String,
    first: A,
    second: B,
}

impl<A, B> Sequence<A, B>
where
    A: Executable,
    B: Executable<Input = A::Output>,
{
    pub fn new(first: A, second: B) -> Self {
        Self {
            name: format!("{}>>{}", first.name(), second.name()),
            first,
            second,
        }
    }
}

#[async_trait]
impl<A, B> Executable for Sequence<A, B>
where
    A: Executable,
    B: Executable<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(sequence = %self.name))]
    async fn run<T: Transport>(
        &self,
        runtime: &Runtime<T>,
        input: &A::Input,
    ) -> Result<ExecutionResult<B::Output>, BuildError> {
        let first = self.first.run(runtime, input).await?;
        let (intermediate, first_attempts, first_usage) = match first {
            ExecutionResult::Success {
                output,
                attempts,
                usage,
                ..
            } => (output, attempts, usage),
            ExecutionResult::Failure(failure) => {
                debug!(stage = self.first.name(), "sequence stopped");
                return Ok(ExecutionResult::Failure(failure));
            }
        };

        Ok(match self.second.run(runtime, &intermediate).await? {
            ExecutionResult::Success {
                output,
                raw,
                attempts,
                usage,
            } => ExecutionResult::Success {
                output,
                raw,
                attempts: first_attempts + attempts,
                usage: first_usage.add(usage),
            },
            ExecutionResult::Failure(failure) => ExecutionResult::Failure(ExecutionFailure {
                attempts: first_attempts + failure.attempts,
                usage: first_usage.add(failure.usage),
                ..failure
            }),
        })
    }
}

/// Run every `(executable, input)` pair concurrently on one runtime.
///
/// All executions start before any is awaited to completion; results come back
/// in input order and one failure does not cancel the others.
#[instrument(skip_all, fields(count = runs.len()))]
pub async fn join_all<E, T>(
    runtime: &Runtime<T>,
    runs: &[(E, E::Input)],
) -> Vec<Result<ExecutionResult<E::Output>, BuildError>>
where
    E: Executable,
    T: Transport,
{
    future::join_all(runs.iter().map(|(executable, input)| executable.run(runtime, input))).await
}
