//! Storage engine - top-level coordinator

use super::flusher::Flusher;
use super::{ReadRequest, StorageConfig};
use crate::files::FileInfo;
use crate::ops::ReadOperation;
use crate::series::Series;
use crate::worker::{TaskHandle, WorkerHandle, WorkerPool};
use crate::{CadenceError, Datapoint, Result, SeriesKey, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared between the engine and its flusher thread
pub(super) struct Shared {
    pub(super) config: Arc<StorageConfig>,
    pub(super) workers: WorkerPool,
    pub(super) series: Mutex<HashMap<String, Arc<Series>>>,
}

impl Shared {
    fn get_or_create(&self, key: String) -> Arc<Series> {
        let mut series = self.series.lock();
        series
            .entry(key)
            .or_insert_with_key(|key| {
                debug!("Created series {}", key);
                Arc::new(Series::new(key.clone(), self.config.clone()))
            })
            .clone()
    }

    fn owner(&self, series: &Series) -> WorkerHandle {
        self.workers.handle(self.workers.worker_for(series.hash()))
    }

    /// Queue a flush on the series' worker.
    ///
    /// Sparse files that cross the optimize threshold are handed to separate
    /// optimizer tasks on the same worker; the flush does not wait for them.
    /// The task yields how many datapoints were flushed, or a
    /// [`CadenceError::Rejected`] when some of them could not be stored.
    pub(super) fn dispatch_flush(&self, series: Arc<Series>) -> Result<TaskHandle<Result<usize>>> {
        let worker = self.owner(&series);
        let followup = worker.clone();
        worker.execute(move || {
            let buffered = series.datapoints_buffered();
            let mut report = series.flush()?;
            for &min_timestamp in &report.candidates {
                schedule_optimizer(&followup, &series, min_timestamp);
            }
            match report.take_rejection() {
                Some(e) => Err(e),
                None => Ok(buffered),
            }
        })
    }

    /// Snapshot of every known series
    pub(super) fn all_series(&self) -> Vec<Arc<Series>> {
        self.series.lock().values().cloned().collect()
    }
}

fn schedule_optimizer(worker: &WorkerHandle, series: &Arc<Series>, min_timestamp: Timestamp) {
    let task_series = series.clone();
    let queued = worker.execute(move || {
        if let Err(e) = task_series.optimize(min_timestamp) {
            warn!("Optimizer failed: {}", e);
        }
    });
    match queued {
        Ok(_) => debug!(
            "Queued optimizer for {} file {} on worker {}",
            series.key(),
            min_timestamp,
            worker.id()
        ),
        Err(e) => warn!(
            "Could not queue optimizer for {} file {}: {}",
            series.key(),
            min_timestamp,
            e
        ),
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub series: usize,
    pub buffered_datapoints: usize,
    /// Pending tasks per worker
    pub worker_queues: Vec<usize>,
}

/// CadenceDB storage engine
pub struct StorageEngine {
    pub(super) shared: Arc<Shared>,
    flusher: Mutex<Option<Flusher>>,
}

impl StorageEngine {
    /// Validate the configuration, create the data directory and start the workers
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| CadenceError::file("create_dir", &config.data_dir, e))?;

        let workers = WorkerPool::new(config.worker_threads, config.worker_queue_limit)?;
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            workers,
            series: Mutex::new(HashMap::new()),
        });

        let flusher = if shared.config.background_flush {
            Some(Flusher::spawn(shared.clone())?)
        } else {
            None
        };

        info!("Opened storage at {}", shared.config.data_dir.display());
        Ok(Self {
            shared,
            flusher: Mutex::new(flusher),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Look up or create the series for a label set
    pub fn series(&self, key: &SeriesKey) -> Result<Arc<Series>> {
        key.validate()?;
        Ok(self.shared.get_or_create(key.canonical()))
    }

    /// Buffer datapoints on the series' worker; returns how many were kept
    pub fn write(&self, key: &SeriesKey, points: &[Datapoint]) -> Result<usize> {
        let series = self.series(key)?;
        let points = points.to_vec();
        let task_series = series.clone();

        self.shared
            .owner(&series)
            .execute(move || task_series.write(&points))
            .and_then(TaskHandle::wait)
            .map_err(|e| e.for_series(series.key()))
    }

    /// Read a range, one chunk at a time on the series' worker.
    ///
    /// `on_chunk` receives each non-empty chunk in timestamp order. With
    /// `prefer_latest` and a limit only the last `limit` datapoints of the range
    /// are delivered. When a file fails mid-read, whatever was read before the
    /// failure is delivered first and the error is returned after it.
    pub fn read<F>(&self, key: &SeriesKey, request: ReadRequest, mut on_chunk: F) -> Result<()>
    where
        F: FnMut(&[Datapoint]) -> Result<()>,
    {
        request.validate()?;
        let series = self.series(key)?;
        if request.limit == Some(0) || request.start == request.end {
            return Ok(());
        }

        let capacity = self.shared.config.read_buffer_size;
        let worker = self.shared.owner(&series);
        let mut latest = match (request.prefer_latest, request.limit) {
            (true, Some(limit)) => Some((limit as usize, VecDeque::new())),
            _ => None,
        };

        let mut op = ReadOperation::new(
            request.start,
            request.end,
            request.limit,
            request.prefer_latest,
            capacity,
        );
        let outcome = loop {
            let task_series = series.clone();
            let (returned, result) = worker
                .execute(move || {
                    let mut op = op;
                    let result = task_series.read(&mut op);
                    (op, result)
                })
                .and_then(TaskHandle::wait)
                .map_err(|e| e.for_series(series.key()))?;
            op = returned;

            if op.datapoints_in_buffer() > 0 {
                match latest.as_mut() {
                    Some((limit, window)) => {
                        for point in op.buffer() {
                            if window.len() == *limit {
                                window.pop_front();
                            }
                            window.push_back(*point);
                        }
                    }
                    None => on_chunk(op.buffer())?,
                }
            }
            if result.is_err() || op.is_complete() {
                break result;
            }
            op.clear_buffer();
        };

        if let Some((_, mut window)) = latest {
            for chunk in window.make_contiguous().chunks(capacity) {
                on_chunk(chunk)?;
            }
        }
        outcome
    }

    /// Read a whole range into memory
    pub fn read_all(&self, key: &SeriesKey, request: ReadRequest) -> Result<Vec<Datapoint>> {
        match self.read_partial(key, request) {
            (points, None) => Ok(points),
            (_, Some(e)) => Err(e),
        }
    }

    /// Read a whole range into memory, keeping what was read before any failure
    pub fn read_partial(
        &self,
        key: &SeriesKey,
        request: ReadRequest,
    ) -> (Vec<Datapoint>, Option<CadenceError>) {
        let mut points = Vec::new();
        let result = self.read(key, request, |chunk| {
            points.extend_from_slice(chunk);
            Ok(())
        });
        (points, result.err())
    }

    /// Flush one series on its worker; returns how many datapoints were written
    pub fn flush_series(&self, key: &SeriesKey) -> Result<usize> {
        let series = self.series(key)?;
        let key = series.key().to_string();
        self.shared
            .dispatch_flush(series)
            .and_then(TaskHandle::wait)
            .and_then(|flushed| flushed)
            .map_err(|e| e.for_series(&key))
    }

    /// Flush every series with buffered datapoints; returns how many series were flushed.
    ///
    /// Every series is attempted; the first failure is reported afterwards.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        let mut first_error = None;

        for series in self.shared.all_series() {
            if series.datapoints_buffered() == 0 {
                continue;
            }
            let key = series.key().to_string();
            match self
                .shared
                .dispatch_flush(series)
                .and_then(TaskHandle::wait)
                .and_then(|flushed| flushed)
            {
                Ok(_) => flushed += 1,
                Err(e) => {
                    warn!("Flush failed for {}: {}", key, e);
                    first_error.get_or_insert(e.for_series(&key));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Wait until every task queued so far, on every worker, has run
    pub fn wait_idle(&self) -> Result<()> {
        let mut barriers = Vec::with_capacity(self.shared.workers.len());
        for worker in 0..self.shared.workers.len() {
            loop {
                match self.shared.workers.execute(worker, || ()) {
                    Ok(barrier) => {
                        barriers.push(barrier);
                        break;
                    }
                    Err(CadenceError::WorkerTooBusy { .. }) => {
                        std::thread::sleep(Duration::from_millis(1))
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        for barrier in barriers {
            barrier.wait()?;
        }
        Ok(())
    }

    /// Files backing a series, listed on its worker
    pub fn describe_series(&self, key: &SeriesKey) -> Result<Vec<FileInfo>> {
        let series = self.series(key)?;
        let task_series = series.clone();
        self.shared
            .owner(&series)
            .execute(move || task_series.describe())
            .and_then(TaskHandle::wait)
            .and_then(|files| files)
            .map_err(|e| e.for_series(series.key()))
    }

    pub fn stats(&self) -> EngineStats {
        let series = self.shared.all_series();
        EngineStats {
            series: series.len(),
            buffered_datapoints: series.iter().map(|s| s.datapoints_buffered()).sum(),
            worker_queues: (0..self.shared.workers.len())
                .map(|w| self.shared.workers.queued(w))
                .collect(),
        }
    }

    /// Stop the flusher, then let the workers drain their queues and exit.
    ///
    /// Buffered datapoints are not flushed; call `flush_all` first to keep them.
    pub fn shutdown(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.stop();
        }
        self.shared.workers.shutdown();
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
