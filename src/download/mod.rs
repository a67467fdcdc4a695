//! The download pipeline.
//!
//! Submodules:
//! - `manager`  — spawner + bounded worker pool driving plugin thunks
//! - `sink`     — the write capabilities handed to each thunk
//! - `progress` — per-worker speed rings and the cumulative progress line
//! - `archive`  — post-run packaging of title directories into zips

pub mod archive;
pub mod manager;
pub mod progress;
pub mod sink;

use std::path::PathBuf;

use thiserror::Error;

pub use manager::DownloadManager;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("plugin returned no download generator")]
    NilGenerator,
    #[error("got no downloaders from the plugin")]
    NoDownloaders,
    #[error("the download failed to finish because of an interrupt")]
    Interrupted,
    #[error("plugin did not return a relative file path: {0}")]
    NotRelative(PathBuf),
    #[error("plugin returned a file path without a parent directory: {0}")]
    NoParent(PathBuf),
    #[error("plugin did not return the path to a file: {0}")]
    NotFile(PathBuf),
    #[error("special option {key:?} was not of the expected type")]
    SpecialOptionType { key: String },
    #[error("worker #{worker} panicked: {message}")]
    WorkerPanic { worker: usize, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
