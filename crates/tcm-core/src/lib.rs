//! # tcm-core
//!
//! Core types, traits, and utilities for the timeseries cardinality manager.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared across all other tcm components. It includes:
//!
//! - Scrape job, metric candidate and drop record types
//! - Label sets and job selectors
//! - Traits for the metrics backend, the configuration store, instrumentation
//!   and tick sources, together with in-memory mocks
//! - Configuration schema and parsing utilities
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod labels;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use crate::config::{
    AlertingRule, BudgetConfig, Config, ControlConfig, DropMode, RecordingRule,
    RemoteWriteConfig, RulesConfig, ScrapeJobConfig,
};
pub use crate::error::{Error, ErrorContext, Result};
pub use labels::LabelSet;
pub use traits::{
    ConfigStore, InstrumentationSink, MetricsBackend, MockMetricsBackend, RecordingSink,
    TickSource,
};
pub use types::{
    ControlEvent, DropRecord, FailureKind, KeepSet, MetricCandidate, RemoteWriteRestriction,
    ScrapeJob,
};
