//! Post-run packaging: one deflate zip per top-level title directory.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::write::FileOptions;
use zip::CompressionMethod;

use super::DownloadError;

/// General-purpose bit 11: entry names are UTF-8. Readers on the receiving
/// end key their filename decoding off this bit, so every entry carries it,
/// ASCII names included.
const GPBF_UTF8_NAMES: u16 = 0x0800;

const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const CENTRAL_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];
const LOCAL_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Partition the saved artifacts by their first path component under
/// `run_dir` and write `<component>.zip` next to them. On success the source
/// directories are deleted when `delete_after` is set. Returns the archive
/// paths.
pub fn archive_titles(
    run_dir: &Path,
    paths: &[PathBuf],
    delete_after: bool,
) -> Result<Vec<PathBuf>, DownloadError> {
    // BTreeMap keeps archive creation in a stable order.
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for path in paths {
        let rel = match path.strip_prefix(run_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let mut components = rel.components();
        let top = match components.next() {
            Some(c) => c.as_os_str().to_string_lossy().into_owned(),
            None => continue,
        };
        // the sink guarantees at least one parent directory
        groups.entry(top).or_default().push(components.as_path().to_path_buf());
    }

    let mut archives = Vec::with_capacity(groups.len());
    for (dir, files) in &groups {
        let archive_path = run_dir.join(format!("{dir}.zip"));
        info!("zipping files to: {}", archive_path.display());

        let out = File::create(&archive_path)?;
        let mut writer = zip::ZipWriter::new(out);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for file in files {
            debug!("  zipping file: {}", file.display());
            let entry_name = file
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            writer.start_file(entry_name, options)?;
            let mut src = File::open(run_dir.join(dir).join(file))?;
            io::copy(&mut src, &mut writer)?;
        }
        writer.finish()?;
        force_utf8_name_flags(&archive_path)?;
        archives.push(archive_path);
    }

    if delete_after {
        for dir in groups.keys() {
            let path = run_dir.join(dir);
            debug!("deleting {}", path.display());
            fs::remove_dir_all(&path)?;
        }
    }

    Ok(archives)
}

/// Raise the UTF-8 name bit on every entry of a finished archive. The writer
/// only sets it for names that need non-ASCII bytes, while the format we emit
/// promises it unconditionally, so the local and central headers are patched
/// in place.
fn force_utf8_name_flags(path: &Path) -> Result<(), DownloadError> {
    let mut data = fs::read(path)?;

    let eocd = data
        .windows(4)
        .rposition(|w| w == EOCD_SIGNATURE)
        .ok_or_else(|| bad_archive("missing end-of-central-directory record"))?;
    if data.len() < eocd + 22 {
        return Err(bad_archive("truncated end-of-central-directory record"));
    }
    let entries = read_u16(&data, eocd + 10) as usize;
    let mut offset = read_u32(&data, eocd + 16) as usize;

    for _ in 0..entries {
        if data.len() < offset + 46 || data[offset..offset + 4] != CENTRAL_SIGNATURE {
            return Err(bad_archive("malformed central directory header"));
        }
        let name_len = read_u16(&data, offset + 28) as usize;
        let extra_len = read_u16(&data, offset + 30) as usize;
        let comment_len = read_u16(&data, offset + 32) as usize;
        let local_offset = read_u32(&data, offset + 42) as usize;

        or_u16(&mut data, offset + 8, GPBF_UTF8_NAMES);

        if data.len() < local_offset + 30 || data[local_offset..local_offset + 4] != LOCAL_SIGNATURE
        {
            return Err(bad_archive("malformed local file header"));
        }
        or_u16(&mut data, local_offset + 6, GPBF_UTF8_NAMES);

        offset += 46 + name_len + extra_len + comment_len;
    }

    fs::write(path, data)?;
    Ok(())
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn or_u16(data: &mut [u8], offset: usize, bits: u16) {
    let value = read_u16(data, offset) | bits;
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn bad_archive(what: &str) -> DownloadError {
    DownloadError::Io(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn populate(run: &Path, rels: &[&str]) -> Vec<PathBuf> {
        for rel in rels {
            let path = run.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, rel.as_bytes()).unwrap();
        }
        rels.iter().map(|rel| run.join(rel)).collect()
    }

    #[test]
    fn one_archive_per_title_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path();
        let saved = populate(
            run,
            &[
                "Title A/0001.jpg",
                "Title A/sub/0002.jpg",
                "Title B/0001.png",
            ],
        );

        let archives = archive_titles(run, &saved, true).unwrap();
        assert_eq!(archives.len(), 2);
        assert!(run.join("Title A.zip").is_file());
        assert!(run.join("Title B.zip").is_file());
        // sources are gone after packaging
        assert!(!run.join("Title A").exists());
        assert!(!run.join("Title B").exists());

        let mut archive = zip::ZipArchive::new(File::open(run.join("Title A.zip")).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        // entry paths use forward slashes
        assert_eq!(names, vec!["0001.jpg".to_string(), "sub/0002.jpg".to_string()]);

        let mut content = String::new();
        archive
            .by_name("sub/0002.jpg")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "Title A/sub/0002.jpg");
    }

    // Walks the raw archive bytes: every central directory header and every
    // local file header must carry bit 11, even though these names are pure
    // ASCII and the writer would have left it clear.
    #[test]
    fn every_entry_carries_the_utf8_name_flag() {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path();
        let saved = populate(run, &["Title/0001.jpg", "Title/sub/0002.jpg"]);

        let archives = archive_titles(run, &saved, false).unwrap();
        let data = fs::read(&archives[0]).unwrap();

        let eocd = data.windows(4).rposition(|w| w == EOCD_SIGNATURE).unwrap();
        let entries = read_u16(&data, eocd + 10) as usize;
        assert_eq!(entries, 2);

        let mut offset = read_u32(&data, eocd + 16) as usize;
        for _ in 0..entries {
            assert_eq!(data[offset..offset + 4], CENTRAL_SIGNATURE);
            let central_flags = read_u16(&data, offset + 8);
            assert_ne!(central_flags & GPBF_UTF8_NAMES, 0, "central header flag unset");

            let local_offset = read_u32(&data, offset + 42) as usize;
            assert_eq!(data[local_offset..local_offset + 4], LOCAL_SIGNATURE);
            let local_flags = read_u16(&data, local_offset + 6);
            assert_ne!(local_flags & GPBF_UTF8_NAMES, 0, "local header flag unset");

            let name_len = read_u16(&data, offset + 28) as usize;
            let extra_len = read_u16(&data, offset + 30) as usize;
            let comment_len = read_u16(&data, offset + 32) as usize;
            offset += 46 + name_len + extra_len + comment_len;
        }

        // the archive still reads back fine after patching
        let mut archive = zip::ZipArchive::new(File::open(&archives[0]).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("0001.jpg")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "Title/0001.jpg");
    }

    #[test]
    fn foreign_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let archives =
            archive_titles(dir.path(), &[PathBuf::from("/somewhere/else.bin")], false).unwrap();
        assert!(archives.is_empty());
    }
}
