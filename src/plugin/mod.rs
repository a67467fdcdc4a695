//! The plugin contract between site backends and the download coordinator.
//!
//! A plugin resolves a URL into a lazy stream of one-shot download thunks.
//! Thunks run on parallel workers and only touch the filesystem through the
//! [`ArtifactSink`] they are handed.

pub mod manager;
pub mod options;

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::cookie::Jar;

use crate::download::sink::ArtifactSink;
use options::OptionSet;

/// Passed as `expected_total` when a plugin cannot tell how many downloads a
/// URL will produce.
pub const UNKNOWN_TOTAL: usize = 0;

/// A one-shot unit of work: given the worker id and a sink, fetch and save
/// one page. Must be movable across threads; per-page state is captured by
/// value, shared plugin state by `Arc`.
pub type Downloader = Box<dyn FnOnce(usize, &ArtifactSink) -> anyhow::Result<()> + Send>;

/// Pull-based thunk generator. Yields `None` at end of stream. Titles can run
/// to hundreds of pages, so thunks are materialised one at a time.
pub type DownloadGenerator = Box<dyn FnMut() -> Option<Downloader> + Send>;

/// What `Plugin::open` hands the coordinator.
pub struct PageStream {
    pub generator: Option<DownloadGenerator>,
    pub expected_total: usize,
}

impl PageStream {
    pub fn new(generator: DownloadGenerator, expected_total: usize) -> Self {
        Self {
            generator: Some(generator),
            expected_total,
        }
    }
}

/// The interface every site backend implements.
///
/// One instance serves many URLs: `open` must reset any per-URL state.
/// `can_handle` is stateless and carries no guarantee that `open` follows.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Plugin version, without any "v" prefix. May be empty.
    fn version(&self) -> &'static str {
        ""
    }

    fn can_handle(&self, url: &str) -> bool;

    /// The typed option slots. The host mutates these before `open`.
    fn options(&self) -> &OptionSet;

    /// Authenticate, walk the site API and return the thunk stream.
    fn open(&self, url: &str) -> anyhow::Result<PageStream>;

    /// Called exactly once per run by the coordinator, with the error that
    /// aborted the run, or `None` on success.
    fn finalise(&self, error: Option<&anyhow::Error>);
}

// ── HTTP helpers ────────────────────────────────────────────────

pub const FIREFOX_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; MSIE 9.0; Windows NT 6.1; Trident/5.0)";
pub const IE11_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.1; WOW64; Trident/7.0; rv:11.0) like Gecko";
pub const CHROME_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.3; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/54.0.2840.99 Safari/537.36";

/// Default read timeout for plugin HTTP clients.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Build a blocking client with the shared timeout and, when the plugin needs
/// to inspect its session cookies, an externally owned jar.
pub fn http_client(jar: Option<Arc<Jar>>) -> anyhow::Result<Client> {
    let mut builder = Client::builder().timeout(HTTP_TIMEOUT);
    builder = match jar {
        Some(jar) => builder.cookie_provider(jar),
        None => builder.cookie_store(true),
    };
    Ok(builder.build()?)
}
