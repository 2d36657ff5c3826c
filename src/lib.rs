// Carte Scolaire - Core Library
// Fetch, reconcile and join school and commune data into the map artifacts

pub mod artifact;
pub mod config;
pub mod csv_source;
pub mod datasets;
pub mod election;
pub mod entities;
pub mod error;
pub mod fetcher;
pub mod insee;
pub mod joiner;
pub mod ledger;
pub mod merge_store;
pub mod normalizer;
pub mod pipeline;
pub mod reconciler;
pub mod rules;
pub mod validation;

// Re-export commonly used types
pub use config::{ApiConfig, BoundingBox, Department, PipelineConfig, Region};
pub use entities::{Commune, School};
pub use error::FetchError;
pub use fetcher::{HttpTransport, PaginatedFetcher, Transport};
pub use ledger::{MergeEvent, ProvenanceLedger};
pub use merge_store::{MergeOutcome, MergeStats, MergeStore};
pub use normalizer::{NormalizedRow, RowSchema};
pub use pipeline::{Pipeline, RunSummary, Step};
pub use reconciler::EntityKey;
pub use rules::{SchoolRules, SchoolType, TrackPolicy};
pub use validation::{load_artifacts, Severity, ValidationReport, Validator, Violation};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
