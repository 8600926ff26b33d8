//! Service modules for the ingest → enrich pipeline
//!
//! Source and provider clients sit behind traits ([`MeetingSource`],
//! [`EnrichmentProvider`]) so the pipeline can run against in-process fakes.

pub mod analyzer;
pub mod analyzer_pool;
pub mod dedup;
pub mod enrichment_client;
pub mod ingestor;
pub mod legistar_client;
pub mod normalizer;

pub use analyzer::{Analyzer, Disposition};
pub use analyzer_pool::{AnalyzerPool, PoolConfig, PoolReport};
pub use dedup::{DedupOutcome, Deduplicator, ItemApplied};
pub use enrichment_client::{AnthropicClient, EnrichmentProvider, EnrichmentRequest, ProviderError};
pub use ingestor::{IngestConfig, IngestCursor, IngestReport, Ingestor};
pub use legistar_client::{LegistarClient, MeetingSource, SourceError};
pub use normalizer::{EventPosition, NormalizationError};
