//! The download coordinator.
//!
//! One spawner thread pumps the plugin's thunk generator into a pool of at
//! most `max_workers` worker threads; the main loop selects over interrupts,
//! saved-artifact notifications and completion. The first worker error ends
//! the run, and the plugin's finaliser runs exactly once on every exit path.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use super::archive::archive_titles;
use super::progress::{make_bar, ProgressAggregator};
use super::sink::ArtifactSink;
use super::DownloadError;
use crate::base_system::interrupt::CancelToken;
use crate::plugin::options::OptionValue;
use crate::plugin::{DownloadGenerator, Downloader, Plugin};

/// How often the spawner rechecks the cancel flag while blocked on a slot.
const SPAWN_POLL: Duration = Duration::from_millis(50);

pub struct DownloadManager {
    plugin: Arc<dyn Plugin>,
    directory: PathBuf,
    paths: Mutex<Vec<PathBuf>>,
}

impl DownloadManager {
    pub fn new(plugin: Arc<dyn Plugin>, directory: PathBuf) -> Self {
        Self {
            plugin,
            directory,
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Run one URL to completion. Returns the saved artifact paths in
    /// completion order (not page order).
    pub fn download(
        &self,
        url: &str,
        max_workers: usize,
        archive: bool,
        cancel: &CancelToken,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let result = self.run(url, max_workers, archive, cancel);
        self.plugin.finalise(result.as_ref().err());
        match result {
            Ok(()) => Ok(self
                .paths
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()),
            Err(e) => Err(e),
        }
    }

    fn run(
        &self,
        url: &str,
        mut max_workers: usize,
        mut archive: bool,
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        // Hidden options let the plugin pin the archive flag and worker count
        // regardless of what the user asked for.
        for (key, value) in self.plugin.options().special() {
            match (key.as_str(), value) {
                ("Zip", OptionValue::Bool(v)) => {
                    warn!("this plugin forces the --zip flag to {v}");
                    archive = v;
                }
                ("Zip", _) => {
                    return Err(DownloadError::SpecialOptionType { key: key.clone() }.into());
                }
                ("Workers", OptionValue::Int(v)) => {
                    warn!("this plugin forces the --workers flag to {v}");
                    max_workers = usize::try_from(v)
                        .map_err(|_| DownloadError::SpecialOptionType { key: key.clone() })?;
                }
                ("Workers", _) => {
                    return Err(DownloadError::SpecialOptionType { key: key.clone() }.into());
                }
                _ => {}
            }
        }
        let max_workers = max_workers.max(1);

        let stream = self.plugin.open(url)?;
        let generator = match stream.generator {
            Some(generator) => generator,
            None => return Err(DownloadError::NilGenerator.into()),
        };

        let progress = Arc::new(
            ProgressAggregator::new(stream.expected_total)
                .with_reports_per_sample(8 * max_workers),
        );

        // nil or the first error, once the spawner has stopped handing out work
        let (done_tx, done_rx) = bounded::<anyhow::Result<()>>(1);
        // paths of files as they are written to disk
        let (saved_tx, saved_rx) = bounded::<PathBuf>(max_workers);

        self.paths.lock().unwrap_or_else(|e| e.into_inner()).clear();

        let spawner = {
            let plugin = Arc::clone(&self.plugin);
            let progress = Arc::clone(&progress);
            let directory = self.directory.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                let outcome = pump_generator(
                    generator, plugin, progress, directory, saved_tx, max_workers, &cancel,
                );
                // send before joining stragglers so errors surface promptly
                let _ = done_tx.send(outcome.result);
                for handle in outcome.workers {
                    let _ = handle.join();
                }
            })
        };

        let bar = make_bar(stream.expected_total);
        let outcome = loop {
            select! {
                recv(cancel.receiver()) -> _ => {
                    info!("interrupted, waiting for in-flight downloads...");
                    // keep draining saved-file notifications so no worker can
                    // block on a full channel while we wait for the pool
                    while !spawner.is_finished() {
                        select! {
                            recv(saved_rx) -> _ => {}
                            default(SPAWN_POLL) => {}
                        }
                    }
                    let _ = spawner.join();
                    break Err(anyhow!(DownloadError::Interrupted));
                }
                recv(done_rx) -> msg => {
                    // late notifications may still sit in the buffer
                    while let Ok(path) = saved_rx.try_recv() {
                        self.record_saved(path, &bar, &progress);
                    }
                    if cancel.is_cancelled() {
                        // the flag can be raised without this run ever seeing
                        // the channel notification
                        break Err(anyhow!(DownloadError::Interrupted));
                    }
                    break match msg {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("spawner exited without a result")),
                    };
                }
                recv(saved_rx) -> path => {
                    if let Ok(path) = path {
                        self.record_saved(path, &bar, &progress);
                    }
                }
            }
        };
        bar.finish_and_clear();
        outcome?;

        if archive {
            let paths = self
                .paths
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            archive_titles(&self.directory, &paths, true)?;
        }

        Ok(())
    }

    fn record_saved(
        &self,
        path: PathBuf,
        bar: &indicatif::ProgressBar,
        progress: &Arc<ProgressAggregator>,
    ) {
        debug!("got file: {}", path.display());
        progress.advance(1);
        bar.inc(1);
        match path.file_name() {
            Some(name) => bar.set_message(format!(
                "{} | {}",
                progress.speed_display(),
                name.to_string_lossy()
            )),
            None => bar.set_message(progress.speed_display()),
        }
        self.paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path);
    }
}

struct PumpOutcome {
    result: anyhow::Result<()>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Pull thunks and hand each to a fresh worker, blocking on the slot
/// semaphore. Stops at end of stream, on the first worker error, or on
/// cancellation.
fn pump_generator(
    mut generator: DownloadGenerator,
    plugin: Arc<dyn Plugin>,
    progress: Arc<ProgressAggregator>,
    directory: PathBuf,
    saved_tx: Sender<PathBuf>,
    max_workers: usize,
    cancel: &CancelToken,
) -> PumpOutcome {
    // worker-slot semaphore: sending acquires, receiving releases
    let (slot_tx, slot_rx) = bounded::<()>(max_workers);
    let (err_tx, err_rx) = bounded::<anyhow::Error>(max_workers);
    let dir_lock = Arc::new(Mutex::new(()));

    let mut workers = Vec::new();
    let mut count: usize = 0;
    let mut first_error: Option<anyhow::Error> = None;

    'pump: while let Some(thunk) = next_thunk(&mut generator, &mut first_error) {
        if cancel.is_cancelled() {
            break;
        }

        // wait for a free slot, an error, or cancellation
        loop {
            select! {
                recv(err_rx) -> err => {
                    if let Ok(err) = err {
                        first_error = Some(err);
                    }
                    break 'pump;
                }
                send(slot_tx, ()) -> _ => break,
                default(SPAWN_POLL) => {
                    if cancel.is_cancelled() {
                        break 'pump;
                    }
                }
            }
        }

        debug!("spawning worker #{count}...");
        let sink = ArtifactSink::new(
            directory.clone(),
            plugin.name(),
            count,
            saved_tx.clone(),
            Arc::clone(&progress),
            Arc::clone(&dir_lock),
        );
        workers.push(spawn_worker(
            count,
            thunk,
            sink,
            Arc::clone(&progress),
            slot_rx.clone(),
            err_tx.clone(),
        ));
        count += 1;
    }

    if first_error.is_none() {
        // wait for the pool to quiesce, then pick up any buffered error
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        first_error = err_rx.try_recv().ok();
    }

    let result = match first_error {
        Some(err) => Err(err),
        None if count == 0 => Err(anyhow!(DownloadError::NoDownloaders)),
        None => Ok(()),
    };
    PumpOutcome { result, workers }
}

/// Pull the next thunk, converting a panicking generator into an error.
fn next_thunk(
    generator: &mut DownloadGenerator,
    first_error: &mut Option<anyhow::Error>,
) -> Option<Downloader> {
    match panic::catch_unwind(AssertUnwindSafe(|| generator())) {
        Ok(next) => next,
        Err(payload) => {
            *first_error = Some(anyhow!("generator panicked: {}", panic_message(&payload)));
            None
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    thunk: Downloader,
    sink: ArtifactSink,
    progress: Arc<ProgressAggregator>,
    slot_rx: Receiver<()>,
    err_tx: Sender<anyhow::Error>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(move || thunk(worker_id, &sink)));
        // the ring for this worker stops contributing no matter how it ended
        progress.done(worker_id);
        match result {
            Ok(Ok(())) => {
                // free the slot
                let _ = slot_rx.recv();
            }
            Ok(Err(err)) => {
                let _ = err_tx.send(err);
            }
            Err(payload) => {
                let _ = err_tx.send(anyhow!(DownloadError::WorkerPanic {
                    worker: worker_id,
                    message: panic_message(&payload),
                }));
            }
        }
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
