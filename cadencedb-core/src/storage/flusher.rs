//! Background flusher
//!
//! Ranks series by how many datapoints they have buffered and flushes the
//! largest first, each on the series' own worker. A ranking is reused until
//! the re-rank interval passes so the sort cost is spread over many flushes.

use super::engine::Shared;
use crate::worker::TaskHandle;
use crate::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Flushes between checks of the re-rank deadline
const RERANK_CHECK_INTERVAL: usize = 50;

pub(super) struct Flusher {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Flusher {
    pub(super) fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let (stop, stopped) = bounded(1);
        let thread = thread::Builder::new()
            .name("cadence-flusher".into())
            .spawn(move || run(shared, stopped))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Interrupt the flusher and wait for it to exit
    pub(super) fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Flusher thread panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>, stopped: Receiver<()>) {
    info!("Flusher started");
    loop {
        let pause = if flush_round(&shared) == 0 {
            shared.config.flusher_idle_sleep
        } else {
            Duration::ZERO
        };
        match stopped.recv_timeout(pause) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    info!("Flusher stopped");
}

/// Flush series in descending order of buffered datapoints until the list
/// runs out or the re-rank deadline passes. Returns how many series were flushed.
pub(super) fn flush_round(shared: &Shared) -> usize {
    let started = Instant::now();
    let mut ranked: Vec<(usize, _)> = shared
        .all_series()
        .into_iter()
        .map(|s| (s.datapoints_buffered(), s))
        .filter(|(buffered, _)| *buffered > 0)
        .collect();
    if ranked.is_empty() {
        return 0;
    }
    ranked.sort_by_key(|(buffered, _)| Reverse(*buffered));

    let deadline = started + shared.config.flusher_resort_interval;
    let mut flushed = 0;
    let mut datapoints = 0;

    for (i, (_, series)) in ranked.into_iter().enumerate() {
        if i > 0 && i % RERANK_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
            debug!("Re-ranking after {} flushes", i);
            break;
        }

        let key = series.key().to_string();
        match shared
            .dispatch_flush(series)
            .and_then(TaskHandle::wait)
            .and_then(|result| result)
        {
            Ok(count) => {
                flushed += 1;
                datapoints += count;
            }
            Err(e) if e.is_retryable() => debug!("Skipping flush of {}: {}", key, e),
            Err(e) if e.is_invalid_request() => warn!("Flush of {} dropped data: {}", key, e),
            Err(e) => error!("Flush failed for {}: {}", key, e),
        }
    }

    info!(
        "Flushed {} datapoints from {} series in {:?}",
        datapoints,
        flushed,
        started.elapsed()
    );
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ReadRequest, StorageConfig, StorageEngine};
    use crate::{Datapoint, SeriesKey};
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> StorageConfig {
        StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            worker_threads: 2,
            worker_queue_limit: 64,
            background_flush: false,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_round_flushes_every_buffered_series() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(config(&temp_dir)).unwrap();

        for (host, count) in [("a", 3), ("b", 10), ("c", 1)] {
            let key = SeriesKey::new().with_label("host", host);
            let points: Vec<Datapoint> = (0..count).map(|i| Datapoint::new(i, 1.0, 1)).collect();
            engine.write(&key, &points).unwrap();
        }
        engine.series(&SeriesKey::new().with_label("host", "idle")).unwrap();

        assert_eq!(flush_round(&engine.shared), 3);
        assert_eq!(engine.stats().buffered_datapoints, 0);
        assert_eq!(flush_round(&engine.shared), 0);
    }

    #[test]
    fn test_background_flusher_drains_buffers() {
        let temp_dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(StorageConfig {
            background_flush: true,
            flusher_idle_sleep: Duration::from_millis(10),
            ..config(&temp_dir)
        })
        .unwrap();

        let key = SeriesKey::new().with_label("host", "a");
        engine
            .write(&key, &[Datapoint::new(1, 1.0, 1), Datapoint::new(2, 2.0, 1)])
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.stats().buffered_datapoints > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.stats().buffered_datapoints, 0);

        let files = engine.describe_series(&key).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(
            engine.read_all(&key, ReadRequest::new(0, 10)).unwrap().len(),
            2
        );

        engine.shutdown();
    }
}
