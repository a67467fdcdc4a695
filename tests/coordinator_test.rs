//! End-to-end tests for the download coordinator against a synthetic plugin.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use scramdl::base_system::interrupt;
use scramdl::download::{DownloadError, DownloadManager};
use scramdl::plugin::options::{force_workers, force_zip, OptionSet, PluginOption};
use scramdl::plugin::{PageStream, Plugin};

#[derive(Clone)]
struct ThunkSpec {
    delay_ms: u64,
    fail: bool,
}

impl ThunkSpec {
    fn ok(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            delay_ms: 0,
            fail: true,
        }
    }
}

#[derive(Default)]
struct Telemetry {
    active: AtomicUsize,
    max_active: AtomicUsize,
    finalise_calls: AtomicUsize,
    finalise_error: Mutex<Option<String>>,
}

impl Telemetry {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TestPlugin {
    options: OptionSet,
    specs: Vec<ThunkSpec>,
    nil_generator: bool,
    telemetry: Arc<Telemetry>,
}

impl TestPlugin {
    fn new(specs: Vec<ThunkSpec>) -> Self {
        Self {
            options: OptionSet::new(vec![PluginOption::string("Flavor", "plain")]),
            specs,
            nil_generator: false,
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    fn with_options(mut self, options: Vec<PluginOption>) -> Self {
        self.options = OptionSet::new(options);
        self
    }

    fn with_nil_generator(mut self) -> Self {
        self.nil_generator = true;
        self
    }
}

impl Plugin for TestPlugin {
    fn name(&self) -> &'static str {
        "Synthetic"
    }

    fn can_handle(&self, url: &str) -> bool {
        url.starts_with("test://")
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn open(&self, _url: &str) -> anyhow::Result<PageStream> {
        let total = self.specs.len();
        if self.nil_generator {
            return Ok(PageStream {
                generator: None,
                expected_total: total,
            });
        }

        let mut remaining = self.specs.clone();
        remaining.reverse();
        let telemetry = Arc::clone(&self.telemetry);
        let mut index = 0usize;
        let generator = Box::new(move || {
            let spec = remaining.pop()?;
            let telemetry = Arc::clone(&telemetry);
            let page = index;
            index += 1;
            Some(Box::new(
                move |worker: usize, sink: &scramdl::download::sink::ArtifactSink| {
                    telemetry.enter();
                    thread::sleep(Duration::from_millis(spec.delay_ms));
                    let result = if spec.fail {
                        Err(anyhow::anyhow!("synthetic failure on page {page}"))
                    } else {
                        let path = PathBuf::from("title").join(format!("{page:04}-{worker}.bin"));
                        sink.save_bytes(&path, &mut std::io::Cursor::new([0u8]), true)
                            .map(|_| ())
                            .map_err(Into::into)
                    };
                    telemetry.leave();
                    result
                },
            ) as scramdl::plugin::Downloader)
        });
        Ok(PageStream::new(generator, total))
    }

    fn finalise(&self, error: Option<&anyhow::Error>) {
        self.telemetry.finalise_calls.fetch_add(1, Ordering::SeqCst);
        let mut slot = self
            .telemetry
            .finalise_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = error.map(|e| format!("{e:#}"));
    }
}

fn run_download(
    plugin: TestPlugin,
    workers: usize,
    archive: bool,
) -> (
    anyhow::Result<Vec<PathBuf>>,
    Arc<Telemetry>,
    tempfile::TempDir,
    Duration,
) {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::clone(&plugin.telemetry);
    let manager = DownloadManager::new(Arc::new(plugin), dir.path().to_path_buf());
    let start = Instant::now();
    let result = manager.download("test://run", workers, archive, &interrupt::CancelToken::never());
    let elapsed = start.elapsed();
    (result, telemetry, dir, elapsed)
}

#[test]
fn full_run_completes_with_all_artifacts() {
    let specs = vec![ThunkSpec::ok(50); 20];
    let (result, telemetry, dir, elapsed) = run_download(TestPlugin::new(specs), 4, false);

    let paths = result.unwrap();
    assert_eq!(paths.len(), 20);
    // 20 thunks of 50 ms across 4 workers: five waves
    assert!(elapsed >= Duration::from_millis(250), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(900), "elapsed {elapsed:?}");

    // every artifact exists, exactly once, under the run directory
    let unique: HashSet<_> = paths.iter().collect();
    assert_eq!(unique.len(), paths.len());
    for path in &paths {
        assert!(path.starts_with(dir.path()));
        assert!(path.is_file());
    }

    assert_eq!(telemetry.finalise_calls.load(Ordering::SeqCst), 1);
    assert!(telemetry
        .finalise_error
        .lock()
        .unwrap()
        .is_none());
}

#[test]
fn worker_pool_is_bounded() {
    let specs = vec![ThunkSpec::ok(40); 12];
    let (result, telemetry, _dir, _elapsed) = run_download(TestPlugin::new(specs), 3, false);
    result.unwrap();
    assert!(telemetry.max_active.load(Ordering::SeqCst) <= 3);
}

#[test]
fn first_error_aborts_promptly() {
    let mut specs = vec![ThunkSpec::failing()];
    specs.extend(vec![ThunkSpec::ok(600); 19]);
    let (result, telemetry, dir, elapsed) = run_download(TestPlugin::new(specs), 4, false);

    let err = result.unwrap_err();
    assert!(err.to_string().contains("synthetic failure"));
    assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");

    // at most the in-flight workers may have written files by now
    let on_disk = std::fs::read_dir(dir.path().join("title"))
        .map(|rd| rd.count())
        .unwrap_or(0);
    assert!(on_disk <= 4, "{on_disk} files on disk");

    assert_eq!(telemetry.finalise_calls.load(Ordering::SeqCst), 1);
    let recorded = telemetry.finalise_error.lock().unwrap();
    assert!(recorded.as_deref().unwrap_or("").contains("synthetic failure"));
    drop(recorded);

    // let stragglers drain before the tempdir goes away
    thread::sleep(Duration::from_millis(800));
}

#[test]
fn empty_generator_is_an_error() {
    let (result, telemetry, _dir, _elapsed) = run_download(TestPlugin::new(vec![]), 2, false);
    let err = result.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DownloadError>(),
        Some(DownloadError::NoDownloaders)
    ));
    assert_eq!(telemetry.finalise_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_generator_is_an_error() {
    let plugin = TestPlugin::new(vec![ThunkSpec::ok(1)]).with_nil_generator();
    let (result, _telemetry, _dir, _elapsed) = run_download(plugin, 2, false);
    assert!(matches!(
        result.unwrap_err().downcast_ref::<DownloadError>(),
        Some(DownloadError::NilGenerator)
    ));
}

#[test]
fn hidden_worker_option_overrides_the_pool_size() {
    let plugin = TestPlugin::new(vec![ThunkSpec::ok(40); 10]).with_options(vec![force_workers(2)]);
    let (result, telemetry, _dir, _elapsed) = run_download(plugin, 8, false);
    result.unwrap();
    assert!(telemetry.max_active.load(Ordering::SeqCst) <= 2);
}

#[test]
fn hidden_zip_option_overrides_the_archive_flag() {
    let plugin = TestPlugin::new(vec![ThunkSpec::ok(1); 3]).with_options(vec![force_zip(false)]);
    let (result, _telemetry, dir, _elapsed) = run_download(plugin, 2, true);
    result.unwrap();
    // the plugin pinned zipping off: sources stay, no archive appears
    assert!(dir.path().join("title").is_dir());
    assert!(!dir.path().join("title.zip").exists());
}

#[test]
fn mistyped_special_option_is_fatal() {
    let plugin = TestPlugin::new(vec![ThunkSpec::ok(1)])
        .with_options(vec![PluginOption::string("!Workers", "two")]);
    let (result, _telemetry, _dir, _elapsed) = run_download(plugin, 2, false);
    assert!(matches!(
        result.unwrap_err().downcast_ref::<DownloadError>(),
        Some(DownloadError::SpecialOptionType { .. })
    ));
}

#[test]
fn archive_after_completion_packages_titles() {
    let plugin = TestPlugin::new(vec![ThunkSpec::ok(1); 5]);
    let (result, _telemetry, dir, _elapsed) = run_download(plugin, 2, true);
    result.unwrap();
    assert!(dir.path().join("title.zip").is_file());
    assert!(!dir.path().join("title").exists());
}

#[test]
fn interrupt_stops_the_run_and_awaits_workers() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = TestPlugin::new(vec![ThunkSpec::ok(300); 6]);
    let telemetry = Arc::clone(&plugin.telemetry);
    let manager = DownloadManager::new(Arc::new(plugin), dir.path().to_path_buf());

    let (handle, token) = interrupt::pair();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        handle.cancel();
    });

    let start = Instant::now();
    let result = manager.download("test://run", 2, false, &token);
    let elapsed = start.elapsed();
    canceller.join().unwrap();

    assert!(matches!(
        result.unwrap_err().downcast_ref::<DownloadError>(),
        Some(DownloadError::Interrupted)
    ));
    // in-flight workers were awaited before returning
    assert_eq!(telemetry.active.load(Ordering::SeqCst), 0);
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");

    assert_eq!(telemetry.finalise_calls.load(Ordering::SeqCst), 1);
    let recorded = telemetry.finalise_error.lock().unwrap();
    assert!(recorded.as_deref().unwrap_or("").contains("interrupt"));
}
