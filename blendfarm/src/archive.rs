use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::FarmError;

/// Bundles a finished animation's frames into one downloadable file.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive the files directly inside `source` into `destination`.
    async fn archive(&self, source: &Path, destination: &Path) -> Result<(), FarmError>;
}

/// Writes a deflate-compressed zip archive.
///
/// The archive is written next to its destination and renamed into place,
/// so a destination that exists is always complete.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZipArchiver;

#[async_trait]
impl Archiver for ZipArchiver {
    async fn archive(&self, source: &Path, destination: &Path) -> Result<(), FarmError> {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let entries =
            tokio::task::spawn_blocking(move || zip_folder(&source, &destination))
                .await
                .map_err(|err| FarmError::Archive(err.to_string()))??;
        info!(entries, "animation archived");
        Ok(())
    }
}

fn zip_folder(source: &Path, destination: &Path) -> Result<usize, FarmError> {
    let mut files: Vec<PathBuf> = fs::read_dir(source)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    files.sort();

    let partial = destination.with_extension("zip.partial");
    let mut writer = ZipWriter::new(File::create(&partial)?);
    for path in &files {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        writer.start_file(name, options)?;
        io::copy(&mut File::open(path)?, &mut writer)?;
    }
    writer.finish()?;
    fs::rename(&partial, destination)?;

    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_archive_contains_every_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frames = dir.path().join("shot_1");
        fs::create_dir(&frames).expect("frames dir");
        for n in 1..=3 {
            fs::write(frames.join(format!("shot_1-{n:04}.png")), format!("frame {n}"))
                .expect("write frame");
        }
        fs::create_dir(frames.join("nested")).expect("nested dir");
        let destination = dir.path().join("shot_1.zip");

        ZipArchiver
            .archive(&frames, &destination)
            .await
            .expect("archive written");

        let mut archive =
            zip::ZipArchive::new(File::open(&destination).expect("open archive"))
                .expect("valid zip");
        assert_eq!(archive.len(), 3);

        let mut contents = String::new();
        archive
            .by_name("shot_1-0002.png")
            .expect("frame present")
            .read_to_string(&mut contents)
            .expect("read frame");
        assert_eq!(contents, "frame 2");
        assert!(!destination.with_extension("zip.partial").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");

        let err = ZipArchiver
            .archive(&dir.path().join("absent"), &dir.path().join("absent.zip"))
            .await
            .expect_err("source missing");
        assert!(matches!(err, FarmError::Io(_)));
    }
}
