//! EBookJapan plugin.
//!
//! This reader cannot be reverse-engineered, so pages are lifted out of a
//! scripted browser as canvas data URIs. The driver itself sits behind
//! [`PageRenderer`]; the plugin surfaces as a single serialized thunk that
//! walks every page in order, because one browser cannot serve parallel
//! workers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use tracing::{debug, info};

use super::{encode_page, output_ext, page_file_name};
use crate::base_system::fs_name::title_dir;
use crate::plugin::options::{OptionSet, PluginOption};
use crate::plugin::{PageStream, Plugin};

/// How long to wait for one page's data before giving up.
const DATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for page data.
const DATA_POLLING: Duration = Duration::from_millis(500);
/// Pages ripped before the reader is reopened to cap renderer memory.
const REOPEN_COUNT: usize = 50;

fn re_reader_url() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(r"^https?://br\.ebookjapan\.jp/br/reader/viewer/view\.html\?.+$").unwrap()
    })
}

/// The scripted-browser surface the plugin drives. Implementations own the
/// browser lifecycle; all calls are serialized.
pub trait PageRenderer: Send {
    /// Total number of pages the opened reader exposes.
    fn page_count(&self) -> usize;
    /// Title of the opened reader page.
    fn title(&self) -> String;
    /// Ask the renderer to start producing a page in the background.
    fn prefetch(&mut self, page: usize) -> anyhow::Result<()>;
    /// The page's canvas as a data URI, or `None` while still rendering.
    fn poll_page_data(&mut self, page: usize) -> anyhow::Result<Option<String>>;
    /// Drop renderer-side buffers for an already consumed page.
    fn release_page(&mut self, page: usize) -> anyhow::Result<()>;
    /// Tear the reader page down and load it again.
    fn reopen(&mut self) -> anyhow::Result<()>;
}

/// Opens a renderer for a reader URL.
pub type RendererFactory =
    Box<dyn Fn(&str) -> anyhow::Result<Box<dyn PageRenderer>> + Send + Sync>;

pub struct EBookJapan {
    options: OptionSet,
    renderer: RendererFactory,
}

impl EBookJapan {
    pub fn new() -> Self {
        Self::with_renderer(Box::new(|_url| {
            bail!("no scripted browser is configured for the EBookJapan reader")
        }))
    }

    /// Inject a renderer implementation (tests, alternative drivers).
    pub fn with_renderer(renderer: RendererFactory) -> Self {
        Self {
            options: OptionSet::new(vec![
                PluginOption::boolean("Lossless", false).comment(
                    "If set to true, save as PNG. Original images are in JPEG, so you can't \
                     escape some artifacts even with this on.",
                ),
                PluginOption::int("JPEGQuality", 95).comment(
                    "Does nothing if Lossless is on. >95 not advised, as it increases file \
                     size a ton for little improvement.",
                ),
                PluginOption::int("PrefetchCount", 5).comment(
                    "How many pages should be prefetched. The higher, the faster downloads, \
                     but also more RAM and CPU usage.",
                ),
            ]),
            renderer,
        }
    }
}

impl Default for EBookJapan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for EBookJapan {
    fn name(&self) -> &'static str {
        "EBookJapan"
    }

    fn can_handle(&self, url: &str) -> bool {
        re_reader_url().is_match(url)
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn open(&self, url: &str) -> anyhow::Result<PageStream> {
        let lossless = self.options.bool_value("Lossless").unwrap_or(false);
        let quality = self.options.int_value("JPEGQuality").unwrap_or(95).clamp(1, 100) as u8;
        let prefetch_count = self.options.int_value("PrefetchCount").unwrap_or(5).max(1) as usize;
        let ext = output_ext(lossless);

        info!("opening the reader...");
        let renderer = (self.renderer)(url)?;
        let length = renderer.page_count();
        let dir = title_dir(&renderer.title());
        let renderer = Arc::new(Mutex::new(renderer));

        // One renderer, one thunk: the generator fires exactly once and the
        // thunk serialises every page internally.
        let mut once = false;
        let generator = Box::new(move || {
            if once {
                return None;
            }
            once = true;

            let renderer = Arc::clone(&renderer);
            let dir = dir.clone();
            Some(Box::new(
                move |_worker: usize, sink: &crate::download::sink::ArtifactSink| {
                    let mut renderer = renderer.lock().unwrap_or_else(|e| e.into_inner());
                    let mut prefetched = vec![false; length];
                    let mut reopened = false;

                    for page in 0..length {
                        // The renderer leaks per page; closing and reopening
                        // the reader keeps it alive across long titles.
                        if page != 0 && page % REOPEN_COUNT == 0 {
                            info!("closing and reopening reader...");
                            renderer.reopen()?;
                            reopened = true;
                        }

                        for ahead in 0..prefetch_count {
                            let target = page + ahead;
                            if target >= length || prefetched[target] {
                                continue;
                            }
                            // do not run past the next reopen boundary
                            if !reopened && page != 0 && target % REOPEN_COUNT == 0 {
                                break;
                            }
                            reopened = false;
                            debug!("prefetching page {}...", target + 1);
                            renderer.prefetch(target)?;
                            prefetched[target] = true;
                        }

                        let data = wait_for_page(renderer.as_mut(), page)?;
                        let bytes = decode_data_uri(&data)?;
                        sink.copy(&mut std::io::sink(), &mut bytes.as_slice())?;
                        renderer.release_page(page)?;

                        let img = image::load_from_memory(&bytes)?.to_rgba8();
                        let path = PathBuf::from(&dir).join(page_file_name(page, 0, ext));
                        let writer = sink.stream_writer(&path, false)?;
                        encode_page(writer, &img, lossless, quality)?;
                    }
                    Ok(())
                },
            ) as crate::plugin::Downloader)
        });

        Ok(PageStream::new(generator, length))
    }

    fn finalise(&self, _error: Option<&anyhow::Error>) {}
}

fn wait_for_page(renderer: &mut dyn PageRenderer, page: usize) -> anyhow::Result<String> {
    let start = Instant::now();
    while start.elapsed() < DATA_TIMEOUT {
        if let Some(data) = renderer.poll_page_data(page)? {
            if !data.is_empty() {
                return Ok(data);
            }
        }
        thread::sleep(DATA_POLLING);
    }
    bail!("page data did not return before the time limit")
}

/// The canvas hands back `data:image/...;base64,<payload>`.
fn decode_data_uri(data: &str) -> anyhow::Result<Vec<u8>> {
    if data.len() < 22 {
        bail!("page data shorter than expected: {}", data.len());
    }
    let payload = data
        .split_once(',')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow!("malformed data URI"))?;
    Ok(BASE64.decode(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_dispatch() {
        let plugin = EBookJapan::new();
        assert!(plugin.can_handle("https://br.ebookjapan.jp/br/reader/viewer/view.html?sessionid=x"));
        assert!(!plugin.can_handle("https://br.ebookjapan.jp/br/reader/viewer/view.html"));
    }

    #[test]
    fn data_uri_decoding() {
        let uri = format!("data:image/png;base64,{}", BASE64.encode(b"some png bytes here"));
        assert_eq!(decode_data_uri(&uri).unwrap(), b"some png bytes here");
        assert!(decode_data_uri("data:,").is_err());
    }

    #[test]
    fn missing_renderer_fails_open() {
        let plugin = EBookJapan::new();
        assert!(plugin
            .open("https://br.ebookjapan.jp/br/reader/viewer/view.html?x=1")
            .is_err());
    }
}
