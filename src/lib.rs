//! Resumable screening of German companies by their shareholder lists.
//!
//! Companies are imported into a SQLite work store, their Gesellschafterliste
//! is retrieved under a persisted rate limit, parsed into an ownership record
//! with a confidence score, and classified by the number of natural persons
//! holding shares.

pub mod classify;
pub mod cli;
pub mod company;
pub mod config;
pub mod documents;
pub mod export;
pub mod extractor;
pub mod fetcher;
pub mod import;
pub mod interrupt;
pub mod logger;
pub mod ownership;
pub mod pipeline;
pub mod qualification;
pub mod rate_limit;
pub mod retention;
pub mod store;

pub use company::{CompanyKey, LifecycleState, Phase};
pub use pipeline::{Pipeline, PipelineSettings};
pub use store::{Outcome, WorkStore};
