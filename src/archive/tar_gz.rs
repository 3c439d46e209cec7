use crate::runtime::Runtime;
use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use log::debug;
use std::path::Path;
use tar::Archive;

use super::ArchiveExtractor;

/// Extractor for .tar.gz archives
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn can_handle(&self, archive_name: &str) -> bool {
        archive_name.to_lowercase().ends_with(".tar.gz")
    }

    fn extract<R: Runtime>(&self, runtime: &R, archive_path: &Path, extract_to: &Path) -> Result<()> {
        debug!("Extracting tar.gz archive {:?} to {:?}...", archive_path, extract_to);
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;

        let mut archive = Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(true);

        let mut count = 0usize;
        for entry in archive
            .entries()
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?
        {
            let mut entry = entry.context("Failed to read tar entry")?;
            let path = entry.path()?.into_owned();

            // unpack_in refuses entries escaping the target directory
            let unpacked = entry
                .unpack_in(extract_to)
                .with_context(|| format!("Failed to extract {:?}", path))?;
            if !unpacked {
                debug!("Skipping entry with unsafe path: {:?}", path);
                continue;
            }
            count += 1;
        }

        if count == 0 {
            return Err(anyhow!("Archive {:?} is empty", archive_path));
        }

        Ok(())
    }
}
