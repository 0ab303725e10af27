//! # dbpilot
//!
//! Resilient asynchronous database command execution.
//!
//! The crate is the execution pipeline between a caller's abstract query
//! definition and an underlying database driver: configuration snapshot →
//! data-source cache → resilience policy stack → connection/transaction/
//! command lifecycle → result materialization or streaming, under concurrent
//! callers with hot-reloadable configuration and cooperative cancellation.
//!
//! ## Features
//!
//! - **Three operations**: affected-row counts, typed scalars, and lazily
//!   streamed projected rows
//! - **Data-source cache**: one driver data source per logical connection
//!   name, rebuilt on configuration change
//! - **Resilience pipeline**: retry with exponential backoff and jitter,
//!   per-attempt timeout, circuit breaker, bulkhead, rate limiter — cached
//!   per connection name
//! - **Transaction lifecycle**: committed exactly once or rolled back
//!   exactly once; cleanup errors never mask the original failure
//! - **Scalar coercion**: null-preserving conversion from driver values to
//!   caller-requested types
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbpilot::prelude::*;
//!
//! let mut options = DbOptions::default();
//! options.set_connection_string("defaultDatabase", "server=db1;database=app");
//!
//! let client = DbClient::builder()
//!     .options(options)
//!     .data_source_factory(my_driver_factory)
//!     .build()?;
//!
//! let q = QueryDefinition::text("SELECT count(*) FROM users");
//! let count: Option<i64> = client.execute_scalar(&q, &cancel).await?;
//! ```
//!
//! The wire protocol is delegated: hosts implement [`driver::DataSourceFactory`]
//! and the driver traits for their database of choice.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod coerce;
pub mod config;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod query;
pub mod resilience;
pub mod source_cache;
pub mod value;

/// Prelude module for convenient imports
pub mod prelude {
    // Cancellation is part of every operation signature
    pub use tokio_util::sync::CancellationToken;

    // Error types
    pub use crate::error::{
        DefaultTransientClassifier, Error, ErrorCategory, Result, TransientClassifier,
    };

    // Value and coercion
    pub use crate::coerce::{coerce, FromScalar};
    pub use crate::value::{Row, Value};

    // Query definitions
    pub use crate::query::{
        CommandKind, CommandTimeout, DbType, ParameterDirection, QueryDefinition, QueryParameter,
    };

    // Configuration
    pub use crate::config::{
        apply_connection_strings, BulkheadOptions, CircuitBreakerOptions, DbOptions,
        DbResilienceOptions, KeyValueSource, MapSource, RateLimiterOptions, RetryOptions,
        TimeoutOptions,
    };
    pub use crate::monitor::OptionsMonitor;

    // Driver surface
    pub use crate::driver::{
        CommandSpec, DataSource, DataSourceFactory, DriverConnection, DriverTransaction,
        IsolationLevel, RowReader,
    };

    // Execution
    pub use crate::client::{DbClient, DbClientBuilder, QueryStream};
    pub use crate::resilience::{
        ExecutionContext, PipelineProvider, PipelineStats, ResiliencePipeline,
    };
    pub use crate::source_cache::{DataSourceCache, SourceCacheStats};
}

// Re-export commonly used items at crate root
pub use client::DbClient;
pub use error::{Error, Result};
pub use query::QueryDefinition;
pub use value::Value;
