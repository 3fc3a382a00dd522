//! Stage executor, artifact collector, and output truncation.
//!
//! The executor runs one external program per invocation with a timeout and
//! classifies its failure; the collector turns the files an invocation left
//! behind into typed [`Artifact`](binderflow_types::Artifact) handles.

pub mod collector;
pub mod executor;
pub mod truncation;

pub use collector::{collect_artifacts, OutputPattern};
pub use executor::{ExecOutput, Invocation, ProcessExecutor, StageRunner};
pub use truncation::truncate_output;
