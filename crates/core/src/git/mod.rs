//! Git plumbing for the code flow engine.

pub mod client;

pub use client::{blob_id, ChangeStatus, EntryMode, GitClient, GitCommitInfo, TreeChange};
