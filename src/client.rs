//! Command executor
//!
//! [`DbClient`] orchestrates one execution: snapshot the options, resolve
//! the cached data source and pipeline, then run the attempt body under the
//! pipeline — open connection, begin transaction when isolation asks for
//! one, submit the materialized command, commit or roll back, release the
//! connection on every exit path. Streaming queries materialize rows inside
//! the pipeline (retry atomicity) and yield them lazily through a channel
//! outside it.

use futures::future::BoxFuture;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coerce::{coerce, FromScalar};
use crate::config::{apply_connection_strings, DbOptions, DbResilienceOptions, KeyValueSource};
use crate::driver::{CommandSpec, DataSource, DataSourceFactory, DriverConnection, IsolationLevel};
use crate::error::{DefaultTransientClassifier, Error, Result, TransientClassifier};
use crate::monitor::OptionsMonitor;
use crate::query::QueryDefinition;
use crate::resilience::{ExecutionContext, PipelineProvider, ResiliencePipeline};
use crate::source_cache::{DataSourceCache, SourceCacheStats};
use crate::value::Row;

/// Channel capacity between the materialized result set and the consumer.
const QUERY_STREAM_BUFFER: usize = 32;

// ============================================================================
// DbClient
// ============================================================================

/// The command executor. One instance is safe for concurrent callers;
/// per-execution resources are confined to a single logical flow.
pub struct DbClient {
    options: Arc<OptionsMonitor<DbOptions>>,
    sources: Arc<DataSourceCache>,
    pipelines: Arc<PipelineProvider>,
    disposed: AtomicBool,
}

struct Prepared {
    connection_name: String,
    source: Arc<dyn DataSource>,
    pipeline: Arc<ResiliencePipeline>,
    spec: Arc<CommandSpec>,
    isolation: IsolationLevel,
    ctx: ExecutionContext,
}

impl DbClient {
    /// Wire an executor from its collaborators. Cache invalidation is
    /// attached to both monitors' change events.
    pub fn new(
        options: Arc<OptionsMonitor<DbOptions>>,
        resilience: Arc<OptionsMonitor<DbResilienceOptions>>,
        factory: Arc<dyn DataSourceFactory>,
        classifier: Arc<dyn TransientClassifier>,
    ) -> Arc<Self> {
        let sources = DataSourceCache::new(options.clone(), factory);
        let pipelines = PipelineProvider::new(resilience.clone(), classifier);

        // Change events are invalidation signals; the caches rebuild lazily
        // from the next snapshot.
        let weak_sources = Arc::downgrade(&sources);
        options.on_change(move |_| {
            if let Some(cache) = weak_sources.upgrade() {
                cache.invalidate_all();
            }
        });
        let weak_pipelines = Arc::downgrade(&pipelines);
        resilience.on_change(move |_| {
            if let Some(provider) = weak_pipelines.upgrade() {
                provider.invalidate_all();
            }
        });

        Arc::new(Self {
            options,
            sources,
            pipelines,
            disposed: AtomicBool::new(false),
        })
    }

    /// Builder-style construction with startup validation
    pub fn builder() -> DbClientBuilder {
        DbClientBuilder::new()
    }

    /// Execute a command that modifies data; returns the affected row count.
    pub async fn execute_non_query(
        &self,
        query: &QueryDefinition,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let Prepared {
            connection_name,
            source,
            pipeline,
            spec,
            isolation,
            ctx,
        } = self.prepare(query, cancel)?;

        pipeline
            .execute(&ctx, |token| {
                let source = source.clone();
                let spec = spec.clone();
                async move {
                    run_attempt(&source, isolation, &token, move |conn, tok| {
                        Box::pin(async move { conn.execute_non_query(&spec, tok).await })
                    })
                    .await
                }
            })
            .await
            .map_err(|err| err.with_query_context(&connection_name, &query.command_text))
    }

    /// Execute a command and coerce the first column of the first row.
    /// `Ok(None)` means the result set was empty; a NULL cell coerces to the
    /// requested type's zero/absent value.
    pub async fn execute_scalar<T: FromScalar>(
        &self,
        query: &QueryDefinition,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        let Prepared {
            connection_name,
            source,
            pipeline,
            spec,
            isolation,
            ctx,
        } = self.prepare(query, cancel)?;

        let raw = pipeline
            .execute(&ctx, |token| {
                let source = source.clone();
                let spec = spec.clone();
                async move {
                    run_attempt(&source, isolation, &token, move |conn, tok| {
                        Box::pin(async move { conn.execute_scalar(&spec, tok).await })
                    })
                    .await
                }
            })
            .await
            .map_err(|err| err.with_query_context(&connection_name, &query.command_text))?;

        match raw {
            None => Ok(None),
            Some(value) => coerce::<T>(value).map(Some),
        }
    }

    /// Execute a query and lazily yield one projected value per row.
    ///
    /// The sequence is finite, single-pass, and not restartable. Rows are
    /// fully buffered inside the resilience pipeline before the first item
    /// is yielded; execution failures surface through the stream.
    pub fn query<T, P>(
        &self,
        query: &QueryDefinition,
        projector: P,
        cancel: &CancellationToken,
    ) -> Result<QueryStream<T>>
    where
        T: Send + 'static,
        P: Fn(&Row) -> T + Send + Sync + 'static,
    {
        let Prepared {
            connection_name,
            source,
            pipeline,
            spec,
            isolation,
            ctx,
        } = self.prepare(query, cancel)?;

        let command_text = query.command_text.clone();
        let caller_token = cancel.clone();
        let projector = Arc::new(projector);
        let (sender, receiver) = mpsc::channel::<Result<T>>(QUERY_STREAM_BUFFER);

        tokio::spawn(async move {
            let outcome = pipeline
                .execute(&ctx, |token| {
                    let source = source.clone();
                    let spec = spec.clone();
                    let projector = projector.clone();
                    async move {
                        run_attempt(&source, isolation, &token, move |conn, tok| {
                            Box::pin(async move {
                                let mut reader = conn.execute_reader(&spec, tok).await?;
                                let mut rows = Vec::new();
                                while let Some(row) = reader.next_row(tok).await? {
                                    rows.push((*projector)(&row));
                                }
                                Ok(rows)
                            })
                        })
                        .await
                    }
                })
                .await;

            match outcome {
                Ok(rows) => {
                    debug!(
                        connection = %connection_name,
                        rows = rows.len(),
                        "query materialized; streaming to caller"
                    );
                    for item in rows {
                        tokio::select! {
                            _ = caller_token.cancelled() => {
                                let _ = sender.send(Err(Error::Cancelled)).await;
                                return;
                            }
                            sent = sender.send(Ok(item)) => {
                                if sent.is_err() {
                                    // Receiver dropped; stop yielding
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    let err = err.with_query_context(&connection_name, &command_text);
                    let _ = sender.send(Err(err)).await;
                }
            }
        });

        Ok(QueryStream { receiver })
    }

    /// Dispose the executor: the data-source cache is drained and disposed.
    /// In-flight executions finish on their already-open connections; new
    /// calls fail with `Disposed`. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sources.dispose().await;
    }

    /// Snapshot of the data-source cache counters
    pub fn source_cache_stats(&self) -> SourceCacheStats {
        self.sources.stats()
    }

    /// The pipeline serving a logical connection name (diagnostics)
    pub fn pipeline_for(&self, name: &str) -> Arc<ResiliencePipeline> {
        self.pipelines.get_pipeline(name)
    }

    fn prepare(&self, query: &QueryDefinition, cancel: &CancellationToken) -> Result<Prepared> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        query.validate()?;

        // Read the snapshot once; the execution is frozen against it.
        let options = self.options.current();
        let connection_name = query
            .connection_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(options.default_connection_name.as_str())
            .to_string();

        let source = self.sources.get(&connection_name)?;
        let pipeline = self.pipelines.get_pipeline(&connection_name);

        let isolation = query.isolation.unwrap_or(options.default_isolation);
        let timeout = query.command_timeout.resolve(options.command_timeout());
        let spec = Arc::new(CommandSpec {
            text: query.command_text.clone(),
            kind: query.command_kind,
            timeout_secs: timeout.map(ceil_secs).unwrap_or(0),
            parameters: query.parameters.clone(),
        });

        let ctx = ExecutionContext::new(
            connection_name.clone(),
            query.command_text.clone(),
            query.command_kind,
            query.tag.clone(),
            cancel.clone(),
        );

        Ok(Prepared {
            connection_name,
            source,
            pipeline,
            spec,
            isolation,
            ctx,
        })
    }
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("sources", &self.sources)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Driver timeout is whole seconds: round up, never below one second.
fn ceil_secs(timeout: Duration) -> u32 {
    let secs = if timeout.subsec_nanos() > 0 {
        timeout.as_secs() + 1
    } else {
        timeout.as_secs()
    };
    secs.clamp(1, u64::from(u32::MAX)) as u32
}

// ============================================================================
// Attempt body
// ============================================================================

/// One attempt: open a connection, run the operation inside an optional
/// transaction, release the connection on every exit path.
async fn run_attempt<T>(
    source: &Arc<dyn DataSource>,
    isolation: IsolationLevel,
    token: &CancellationToken,
    op: impl for<'a> FnOnce(
        &'a mut dyn DriverConnection,
        &'a CancellationToken,
    ) -> BoxFuture<'a, Result<T>>,
) -> Result<T> {
    let mut connection = source.open_connection(token).await?;
    let outcome = run_on_connection(&mut *connection, isolation, token, op).await;
    if let Err(close_err) = connection.close().await {
        warn!(error = %close_err, "connection close failed");
    }
    outcome
}

/// Commit exactly once on success; roll back exactly once on failure.
/// Rollback errors are logged and suppressed in favor of the original
/// failure.
async fn run_on_connection<T>(
    connection: &mut dyn DriverConnection,
    isolation: IsolationLevel,
    token: &CancellationToken,
    op: impl for<'a> FnOnce(
        &'a mut dyn DriverConnection,
        &'a CancellationToken,
    ) -> BoxFuture<'a, Result<T>>,
) -> Result<T> {
    let transaction = match isolation {
        IsolationLevel::Unspecified => None,
        level => Some(connection.begin_transaction(level, token).await?),
    };

    match op(connection, token).await {
        Ok(value) => {
            if let Some(tx) = transaction {
                tx.commit().await?;
            }
            Ok(value)
        }
        Err(err) => {
            if let Some(tx) = transaction {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        error = %rollback_err,
                        "rollback failed; surfacing the original error"
                    );
                }
            }
            Err(err)
        }
    }
}

// ============================================================================
// QueryStream
// ============================================================================

/// Lazily yielded projected rows. Finite, single-pass, not restartable.
pub struct QueryStream<T> {
    receiver: mpsc::Receiver<Result<T>>,
}

impl<T> Stream for QueryStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for QueryStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream").finish_non_exhaustive()
    }
}

// ============================================================================
// Builder / registration helper
// ============================================================================

/// Registration helper: applies the connection-strings post-configure step,
/// asserts options validity at startup, and wires the singletons together.
pub struct DbClientBuilder {
    options: Option<Arc<OptionsMonitor<DbOptions>>>,
    resilience: Option<Arc<OptionsMonitor<DbResilienceOptions>>>,
    settings: Option<Arc<dyn KeyValueSource>>,
    factory: Option<Arc<dyn DataSourceFactory>>,
    classifier: Arc<dyn TransientClassifier>,
}

impl Default for DbClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DbClientBuilder {
    /// Create a builder with the default transient classifier
    pub fn new() -> Self {
        Self {
            options: None,
            resilience: None,
            settings: None,
            factory: None,
            classifier: Arc::new(DefaultTransientClassifier),
        }
    }

    /// Provide fixed execution options
    pub fn options(self, options: DbOptions) -> Self {
        self.options_monitor(OptionsMonitor::new(options))
    }

    /// Provide a hot-reloadable options monitor
    pub fn options_monitor(mut self, monitor: Arc<OptionsMonitor<DbOptions>>) -> Self {
        self.options = Some(monitor);
        self
    }

    /// Provide fixed resilience options
    pub fn resilience(self, options: DbResilienceOptions) -> Self {
        self.resilience_monitor(OptionsMonitor::new(options))
    }

    /// Provide a hot-reloadable resilience monitor
    pub fn resilience_monitor(mut self, monitor: Arc<OptionsMonitor<DbResilienceOptions>>) -> Self {
        self.resilience = Some(monitor);
        self
    }

    /// External settings source merged into the connection-string map
    pub fn settings(mut self, source: impl KeyValueSource + 'static) -> Self {
        self.settings = Some(Arc::new(source));
        self
    }

    /// The driver hook producing data sources per connection string
    pub fn data_source_factory(mut self, factory: Arc<dyn DataSourceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the transient-failure classifier
    pub fn transient_classifier(mut self, classifier: Arc<dyn TransientClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Validate and assemble the executor.
    ///
    /// Runs the post-configure step once against the initial snapshot, then
    /// asserts both option sets; construction fails on invalid options.
    pub fn build(self) -> Result<Arc<DbClient>> {
        let factory = self
            .factory
            .ok_or_else(|| Error::config("a data-source factory is required"))?;
        let options = self
            .options
            .unwrap_or_else(|| OptionsMonitor::new(DbOptions::default()));
        let resilience = self
            .resilience
            .unwrap_or_else(|| OptionsMonitor::new(DbResilienceOptions::default()));

        if let Some(settings) = &self.settings {
            let mut configured = (*options.current()).clone();
            apply_connection_strings(&mut configured, settings.as_ref());
            options.update(configured);
        }

        options.current().validate()?;
        resilience.current().validate()?;

        Ok(DbClient::new(options, resilience, factory, self.classifier))
    }
}
