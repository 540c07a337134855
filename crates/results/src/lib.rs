//! Command Results
//!
//! Data model and persistence for the outcome of every command the deployment
//! controller runs.
//!
//! - [`CommandResult`] / [`CommandResultSummary`]: full record and its cheap
//!   listing projection
//! - [`ValidateResult`] and [`DriftDetectionResult`] with their summaries
//! - [`ResultStore`]: write/list/watch/get contract, implemented by
//!   [`MemoryResultStore`] and [`SecretResultStore`]
//!
//! Summaries are always derived from full results through `build_summary()`.

pub mod command_result;
pub mod drift_result;
pub mod error;
pub mod keys;
pub mod memory;
pub mod schema;
pub mod secrets;
pub mod store;
pub mod validate_result;
#[cfg(feature = "test-util")]
pub mod test_util;

pub use command_result::*;
pub use drift_result::*;
pub use error::ResultStoreError;
pub use keys::{ProjectKey, RepoKey, TargetKey};
pub use memory::MemoryResultStore;
pub use secrets::{SecretResultStore, DEFAULT_RESULTS_NAMESPACE};
pub use store::*;
pub use validate_result::*;

/// Generates a new, globally unique result id
pub fn new_result_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
