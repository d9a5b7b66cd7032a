//! Code flow core library.
//!
//! This crate keeps product repositories and a virtual monorepo (VMR) in
//! step: forward flow carries a repository's changes into its VMR subtree,
//! back flow carries VMR changes to the repository. It provides the mapping
//! registry, the sync point and dependency tracker, patch building and
//! application, conflict policies, the version update step, and the
//! [`CodeFlowEngine`] that ties them together.

pub mod assets;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod flow;
pub mod git;
pub mod manifest;
pub mod mapping;
pub mod models;
pub mod patch;
pub mod tracker;

// Re-exports for convenience.
pub use assets::{BuildAssetSource, EmptyAssetSource, JsonFileAssetSource, StaticAssetSource};
pub use config::AppConfig;
pub use db::Database;
pub use flow::{CancellationToken, CodeFlowEngine};
pub use mapping::{Mapping, MappingRegistry};
pub use models::{Direction, FlowRequest, FlowResult, FlowStatus};
pub use tracker::Tracker;
