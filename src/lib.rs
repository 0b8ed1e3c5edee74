//! Mangabook Core Library
//!
//! This library provides the download orchestration engine behind the
//! `mangabook` tool: it decides which manga pages must be fetched, fetches
//! them under bounded concurrency with retry, records every outcome in a
//! durable per-series manifest, and reconciles that manifest against the
//! remote listing on the next run.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`model`] - Content units, groups, work items and fetch outcomes
//! - [`manifest`] - Durable JSON manifest store with retention pruning
//! - [`validate`] - Cheap structural checks for downloaded artifacts
//! - [`reconcile`] - Keep/refetch planning against a fresh remote listing
//! - [`download`] - Concurrency-bounded fetch scheduler with retry and rate limiting
//! - [`source`] - Remote source adapter trait and the `MangaDex` implementation
//! - [`engine`] - Orchestration driver and run summaries
//! - [`paths`] - Filename sanitization and the local library layout

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod engine;
pub mod manifest;
pub mod model;
pub mod paths;
pub mod reconcile;
pub mod source;
pub mod validate;

// Re-export commonly used types
pub use download::{
    DEFAULT_GLOBAL_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_PER_GROUP_CONCURRENCY, FailureType,
    FetchError, FetchScheduler, RateLimiter, RetryDecision, RetryPolicy, RunProgress,
    SchedulerConfig, SchedulerError, classify_error,
};
pub use engine::{
    DEFAULT_MAX_CONCURRENT_GROUPS, EngineConfig, EngineError, GroupPlan, GroupReport, GroupState,
    Orchestrator, RunSummary,
};
pub use manifest::{
    DEFAULT_RETENTION_DAYS, EntryStatus, GroupRecord, Manifest, ManifestEntry, ManifestError,
    ManifestStore,
};
pub use model::{
    ContentUnit, ExpectedArtifact, FetchOutcome, Group, GroupRef, OutcomeStatus, RemoteListing,
    RootInfo, WorkItem, WorkReason,
};
pub use reconcile::{ReconcilePlan, ReconcilePolicy, plan};
pub use source::{ApiSession, MangaDexSource, RemoteSource, SessionConfig, SourceError, UnitBody};
pub use validate::Validator;
