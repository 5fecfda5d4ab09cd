//! Control loop that keeps every cube's tables in the store up to date.
//!
//! One cube at a time: fetch each query, build and persist its table, merge
//! them into the cube table, persist that, then refresh the cube view.

mod error;
mod status;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::Instrument;

use crate::config::SchedulerConfig;
use crate::cube::{merge, Cube, Query};
use crate::metrics;
use crate::schema::SchemaReconciler;
use crate::source::{MetricsSource, SeriesMatrix, SourceError};
use crate::store::CubeStore;
use crate::table::{Table, TableBuilder};
use crate::writer::{BatchWriter, WriteError, WriteReport};

pub use self::error::CubeError;
pub use self::status::{CubeStatus, SharedCubeStatus};

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Resolves once `true` is published. A dropped sender never resolves.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Result of one successful cube cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// The merged cube table as written.
    pub cube: Table,
    pub query_rows: usize,
    pub rows_written: usize,
    pub batches: usize,
    pub ambiguous_rows: usize,
}

#[derive(Debug, Default)]
pub struct TickSummary {
    pub reports: Vec<CycleReport>,
    /// Names of the cubes whose cycle failed.
    pub failed: Vec<String>,
}

pub struct CubeScheduler {
    cubes: Vec<Cube>,
    source: Arc<dyn MetricsSource>,
    reconciler: SchemaReconciler,
    writer: BatchWriter,
    config: SchedulerConfig,
    status: SharedCubeStatus,
}

impl CubeScheduler {
    pub fn new(
        cubes: Vec<Cube>,
        source: Arc<dyn MetricsSource>,
        store: Arc<dyn CubeStore>,
        config: SchedulerConfig,
    ) -> Result<Self, WriteError> {
        let writer = BatchWriter::new(store.clone(), config.batch_size, config.call_timeout)?;
        let reconciler = SchemaReconciler::new(store, config.call_timeout);
        let status: HashMap<String, CubeStatus> = cubes
            .iter()
            .map(|c| (c.name.clone(), CubeStatus::default()))
            .collect();
        Ok(Self {
            cubes,
            source,
            reconciler,
            writer,
            config,
            status: Arc::new(Mutex::new(status)),
        })
    }

    pub fn cubes(&self) -> &[Cube] {
        &self.cubes
    }

    pub fn status(&self) -> SharedCubeStatus {
        self.status.clone()
    }

    /// Runs passes over the cube list until shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "Cube scheduler started: {} cubes, poll interval {:?}",
            self.cubes.len(),
            self.config.poll_interval
        );
        loop {
            if let Err(CubeError::Cancelled) = self.tick(unix_now(), &mut shutdown).await {
                break;
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        log::info!("Cube scheduler stopped");
    }

    /// Processes every cube due at `now`, in configuration order.
    ///
    /// Cube failures are logged and recorded; only cancellation is returned
    /// as an error.
    pub async fn tick(
        &mut self,
        now: i64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<TickSummary, CubeError> {
        let mut summary = TickSummary::default();

        for idx in 0..self.cubes.len() {
            if *shutdown.borrow() {
                return Err(CubeError::Cancelled);
            }
            if !self.cubes[idx].is_due(now) {
                continue;
            }

            let result = {
                let cube = &self.cubes[idx];
                let span = tracing::info_span!("cube", name = %cube.name);
                tokio::select! {
                    res = self.update_cube(cube, now).instrument(span) => res,
                    _ = wait_for_shutdown(shutdown) => Err(CubeError::Cancelled),
                }
            };

            let name = self.cubes[idx].name.clone();
            match result {
                Ok(report) => {
                    self.cubes[idx].last_update = Some(now);
                    let mut status = self.status.lock().await;
                    let entry = status.entry(name).or_default();
                    entry.last_update = Some(now);
                    entry.rows_written = report.rows_written;
                    entry.ambiguous_rows = report.ambiguous_rows;
                    entry.last_error = None;
                    summary.reports.push(report);
                }
                Err(CubeError::Cancelled) => {
                    log::warn!("Cycle of cube '{name}' cancelled by shutdown");
                    return Err(CubeError::Cancelled);
                }
                Err(e) => {
                    log::error!("Cube cycle failed: {e}");
                    metrics::record_failed_cycle();
                    let mut status = self.status.lock().await;
                    let entry = status.entry(name.clone()).or_default();
                    entry.last_error = Some(e.to_string());
                    entry.failed_cycles += 1;
                    summary.failed.push(name);
                }
            }
        }
        Ok(summary)
    }

    /// One full cycle of `cube` over the window ending at `now`. Does not
    /// touch `cube.last_update`.
    pub async fn update_cube(&self, cube: &Cube, now: i64) -> Result<CycleReport, CubeError> {
        // The step at last_update was written by the previous cycle.
        let start = match cube.last_update {
            Some(last) => (last + self.source.step().as_secs().max(1) as i64).min(now),
            None => now - self.config.lookback.as_secs() as i64,
        };
        log::info!("Updating cube '{}' over [{}, {}]", cube.name, start, now);

        let mut tables = Vec::with_capacity(cube.queries.len());
        let mut query_rows = 0;
        for query in &cube.queries {
            let matrix = self.fetch(cube, query, start, now).await?;
            let mut table = TableBuilder::build(query, &matrix);
            table.register_metric(query.value_field());
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("Table '{}':\n{}", table.name, table.preview(10));
            }
            query_rows += self.persist(cube, &table).await?.rows;
            tables.push(table);
        }

        let mut merged = merge(cube, &tables);
        for label in &cube.joined_labels {
            merged.register_dimension(label);
        }
        let ambiguous_rows = merged.ambiguous_rows();
        if ambiguous_rows > 0 {
            metrics::record_ambiguous(ambiguous_rows);
            log::warn!(
                "Cube '{}' has {} ambiguous rows after merge",
                cube.name,
                ambiguous_rows
            );
        }

        let report = self.persist(cube, &merged).await?;
        self.reconciler
            .ensure_view(cube)
            .await
            .map_err(|source| CubeError::Schema {
                cube: cube.name.clone(),
                table: cube.view_name(),
                source,
            })?;

        Ok(CycleReport {
            cube: merged,
            query_rows,
            rows_written: report.rows,
            batches: report.batches,
            ambiguous_rows,
        })
    }

    async fn fetch(
        &self,
        cube: &Cube,
        query: &Query,
        start: i64,
        end: i64,
    ) -> Result<SeriesMatrix, CubeError> {
        let deadline = self.config.call_timeout;
        let call = self.source.query_samples(&query.expression, start, end);
        let result = match tokio::time::timeout(deadline, call).await {
            Ok(res) => res,
            Err(_) => Err(SourceError::Timeout(deadline)),
        };
        result.map_err(|source| CubeError::QuerySource {
            cube: cube.name.clone(),
            query: query.name.clone(),
            source,
        })
    }

    async fn persist(&self, cube: &Cube, table: &Table) -> Result<WriteReport, CubeError> {
        self.reconciler
            .ensure_table(table)
            .await
            .map_err(|source| CubeError::Schema {
                cube: cube.name.clone(),
                table: table.name.clone(),
                source,
            })?;
        self.writer
            .write(table)
            .await
            .map_err(|source| CubeError::Write {
                cube: cube.name.clone(),
                table: table.name.clone(),
                source,
            })
    }
}
