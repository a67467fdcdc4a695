//! The write capabilities a download thunk is handed.
//!
//! Thunks never open files in the run directory themselves: everything goes
//! through the sink, which validates relative paths, creates parent
//! directories behind one lock, feeds byte counts to the progress aggregator
//! and records every successfully closed file as a saved artifact.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use tempfile::NamedTempFile;
use tracing::debug;

use super::progress::ProgressAggregator;
use super::DownloadError;

const COPY_BUF_SIZE: usize = 8 * 1024;

/// One sink per worker; cheap to construct.
pub struct ArtifactSink {
    run_dir: PathBuf,
    plugin_name: String,
    worker_id: usize,
    saved: Sender<PathBuf>,
    progress: Arc<ProgressAggregator>,
    dir_lock: Arc<Mutex<()>>,
}

impl ArtifactSink {
    pub fn new(
        run_dir: PathBuf,
        plugin_name: &str,
        worker_id: usize,
        saved: Sender<PathBuf>,
        progress: Arc<ProgressAggregator>,
        dir_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            run_dir,
            plugin_name: plugin_name.to_string(),
            worker_id,
            saved,
            progress,
            dir_lock,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Open `dst` under the run directory for writing. Closing the writer
    /// records the artifact; with `report` each write also feeds the speed
    /// aggregator.
    pub fn stream_writer(&self, dst: &Path, report: bool) -> Result<SinkWriter, DownloadError> {
        let abs = self.resolve(dst)?;
        let file = File::create(&abs)?;
        Ok(SinkWriter {
            file: Some(file),
            abs,
            report,
            worker_id: self.worker_id,
            saved: self.saved.clone(),
            progress: Arc::clone(&self.progress),
        })
    }

    /// Forward bytes with speed reporting but without recording an artifact.
    /// For intermediate streams the thunk feeds into a descrambler.
    pub fn copy(&self, dst: &mut dyn Write, src: &mut dyn Read) -> Result<u64, DownloadError> {
        self.copy_inner(dst, src, true)
    }

    /// Create + copy + close in one call, recording the artifact.
    pub fn save_bytes(
        &self,
        dst: &Path,
        src: &mut dyn Read,
        report: bool,
    ) -> Result<u64, DownloadError> {
        let abs = self.resolve(dst)?;
        let mut file = File::create(&abs)?;
        let written = self.copy_inner(&mut file, src, report)?;
        file.flush()?;
        drop(file);
        let _ = self.saved.send(abs);
        Ok(written)
    }

    /// Move an existing file (same volume, e.g. from `temp_file`) into the
    /// run directory and record it. `src` must be closed first.
    pub fn save_file(&self, dst: &Path, src: &Path) -> Result<u64, DownloadError> {
        let abs = self.resolve(dst)?;
        let size = fs::metadata(src)?.len();
        fs::rename(src, &abs)?;
        let _ = self.saved.send(abs);
        Ok(size)
    }

    /// A scratch file on the same volume as the run directory, usable with
    /// `save_file`.
    pub fn temp_file(&self) -> Result<NamedTempFile, DownloadError> {
        let tmp_dir = self.run_dir.join(".tmp");
        {
            let _guard = self.dir_lock.lock().unwrap_or_else(|e| e.into_inner());
            if fs::metadata(&tmp_dir).is_err() {
                fs::create_dir_all(&tmp_dir)?;
            }
        }
        let file = tempfile::Builder::new()
            .prefix(&format!("scramdl-{}-", self.plugin_name))
            .tempfile_in(tmp_dir)?;
        debug!(path = %file.path().display(), "temporary file created");
        Ok(file)
    }

    fn copy_inner(
        &self,
        dst: &mut dyn Write,
        src: &mut dyn Read,
        report: bool,
    ) -> Result<u64, DownloadError> {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            dst.write_all(&buf[..n])?;
            written += n as u64;
            if report {
                self.progress.report(self.worker_id, n);
            }
        }
        Ok(written)
    }

    /// Validate the relative destination and return its absolute path with
    /// parent directories created. Creation is serialised across workers so
    /// concurrent mkdir of one title directory cannot race.
    fn resolve(&self, dst: &Path) -> Result<PathBuf, DownloadError> {
        assert_valid_path(dst)?;
        let abs = self.run_dir.join(dst);
        if let Some(dir) = abs.parent() {
            let _guard = self.dir_lock.lock().unwrap_or_else(|e| e.into_inner());
            match fs::metadata(dir) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %dir.display(), "creating non-existing directories");
                    fs::create_dir_all(dir)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(abs)
    }
}

/// A relative path naming a file inside at least one directory. Checked on
/// the raw string: `Path` normalizes trailing separators away, which would
/// let a directory-shaped destination pass as a file.
fn assert_valid_path(path: &Path) -> Result<(), DownloadError> {
    if path.is_absolute() {
        return Err(DownloadError::NotRelative(path.to_path_buf()));
    }
    let raw = path.as_os_str().to_string_lossy();
    if !raw.contains('/') && !raw.contains('\\') {
        return Err(DownloadError::NoParent(path.to_path_buf()));
    }
    if raw.ends_with('/') || raw.ends_with('\\') || path.file_name().is_none() {
        return Err(DownloadError::NotFile(path.to_path_buf()));
    }
    Ok(())
}

/// Writer returned by [`ArtifactSink::stream_writer`]. Write order is the
/// issue order of the thunk; the artifact is recorded on `close`, after all
/// writes.
pub struct SinkWriter {
    file: Option<File>,
    abs: PathBuf,
    report: bool,
    worker_id: usize,
    saved: Sender<PathBuf>,
    progress: Arc<ProgressAggregator>,
}

impl SinkWriter {
    /// Flush, close and record the artifact.
    pub fn close(mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            drop(file);
            let _ = self.saved.send(self.abs.clone());
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.abs
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already closed"))?;
        let n = file.write(buf)?;
        if self.report && n > 0 {
            self.progress.report(self.worker_id, n);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
