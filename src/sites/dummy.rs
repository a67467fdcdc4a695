//! Plugin that produces random data with delayed reads. Acts close enough to
//! a real download to exercise the whole pipeline without touching the
//! network.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use regex::Regex;

use crate::plugin::options::{OptionSet, PluginOption};
use crate::plugin::{PageStream, Plugin};

fn re_dummy_url() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^dummy://(\d+)$").unwrap())
}

/// Sleeps a random interval before each read.
struct DelayedReader<R> {
    inner: R,
    min_ms: u64,
    max_ms: u64,
}

impl<R: Read> Read for DelayedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let delay = rand::thread_rng().gen_range(self.min_ms..self.max_ms);
        thread::sleep(Duration::from_millis(delay));
        self.inner.read(buf)
    }
}

pub struct Dummy {
    options: OptionSet,
}

impl Dummy {
    pub fn new() -> Self {
        Self {
            options: OptionSet::new(vec![
                PluginOption::string("Hello", "World"),
                PluginOption::string("I Like", "Potatoes"),
            ]),
        }
    }
}

impl Default for Dummy {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Dummy {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn can_handle(&self, url: &str) -> bool {
        re_dummy_url().is_match(url)
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn open(&self, url: &str) -> anyhow::Result<PageStream> {
        let length: usize = re_dummy_url()
            .captures(url)
            .and_then(|m| m[1].parse().ok())
            .ok_or_else(|| anyhow::anyhow!("URL could not be parsed: {url}"))?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let dir = format!("dummy-{stamp}");

        let mut produced = 0usize;
        let generator = Box::new(move || {
            if produced >= length {
                return None;
            }
            produced += 1;

            let dir = dir.clone();
            // The thunk gets its identity from the worker id it is handed;
            // payloads are drawn fresh on execution.
            Some(Box::new(
                move |worker: usize, sink: &crate::download::sink::ArtifactSink| {
                    let size = rand::thread_rng().gen_range(100_000..1_100_000);
                    let mut payload = vec![0u8; size];
                    rand::thread_rng().fill(payload.as_mut_slice());
                    let mut reader = DelayedReader {
                        inner: Cursor::new(payload),
                        min_ms: 200,
                        max_ms: 1000,
                    };
                    let path = PathBuf::from(&dir).join(format!("dummy-{worker}.bin"));
                    sink.save_bytes(&path, &mut reader, true)?;
                    Ok(())
                },
            ) as crate::plugin::Downloader)
        });

        Ok(PageStream::new(generator, length))
    }

    fn finalise(&self, _error: Option<&anyhow::Error>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_dispatch() {
        let plugin = Dummy::new();
        assert!(plugin.can_handle("dummy://12"));
        assert!(!plugin.can_handle("dummy://twelve"));
        assert!(!plugin.can_handle("https://example.com/"));
    }

    #[test]
    fn stream_length_matches_url() {
        let plugin = Dummy::new();
        let stream = plugin.open("dummy://3").unwrap();
        assert_eq!(stream.expected_total, 3);
        let mut generator = stream.generator.unwrap();
        let mut count = 0;
        while generator().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
