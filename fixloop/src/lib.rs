//! Resilient execution runtime for declarative LLM-backed agents.
//!
//! An agent declares how to build a prompt and how to parse a reply; this crate
//! takes care of everything in between. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (types, error classification,
//!   response repair, backoff schedule, corrective follow-ups). No I/O.
//! - **[`io`]**: Side-effecting operations (configuration, the hosted API,
//!   subprocess CLI and HTTP gateway transports, child process handling).
//!
//! Orchestration modules ([`fix`], [`execute`], [`coerce`], [`compose`]) combine
//! the two into `Runtime::execute`, which always hands back a typed
//! [`ExecutionResult`](core::types::ExecutionResult).

pub mod agents;
pub mod coerce;
pub mod compose;
pub mod core;
pub mod execute;
pub mod exit_codes;
pub mod fix;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
