mod tar_gz;
mod zip;

use crate::runtime::Runtime;
use anyhow::{Context, Result};
use log::debug;
use std::path::Path;

pub use tar_gz::TarGzExtractor;
pub use zip::ZipExtractor;

/// Trait for format-specific archive extractors
pub trait ArchiveExtractor: Send + Sync {
    /// Check if this extractor can handle the given archive name
    fn can_handle(&self, archive_name: &str) -> bool;

    /// Extract the archive into the specified directory, which must exist
    fn extract<R: Runtime>(&self, runtime: &R, archive_path: &Path, extract_to: &Path) -> Result<()>;
}

/// How a fetched artifact becomes a directory tree, decided by the suffix of its URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    /// Not an archive: the fetched file is moved into place as-is.
    Raw,
}

impl ArchiveKind {
    pub fn from_uri(uri: &str) -> Self {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        if ZipExtractor.can_handle(path) {
            ArchiveKind::Zip
        } else if TarGzExtractor.can_handle(path) {
            ArchiveKind::TarGz
        } else {
            ArchiveKind::Raw
        }
    }
}

/// Dispatcher that selects the appropriate extractor based on archive kind.
pub struct Unpacker {
    tar_gz: TarGzExtractor,
    zip: ZipExtractor,
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::new()
    }
}

impl Unpacker {
    pub fn new() -> Self {
        Self {
            tar_gz: TarGzExtractor,
            zip: ZipExtractor,
        }
    }

    /// Turn the fetched file at `artifact` into the contents of `dest`.
    ///
    /// `dest` is created if missing. A `Raw` artifact is moved into `dest`
    /// under `file_name`.
    #[tracing::instrument(skip(self, runtime))]
    pub fn unpack<R: Runtime>(
        &self,
        runtime: &R,
        kind: ArchiveKind,
        artifact: &Path,
        dest: &Path,
        file_name: &str,
    ) -> Result<()> {
        runtime
            .create_dir_all(dest)
            .with_context(|| format!("Failed to create extraction directory {:?}", dest))?;

        match kind {
            ArchiveKind::Zip => self.zip.extract(runtime, artifact, dest),
            ArchiveKind::TarGz => self.tar_gz.extract(runtime, artifact, dest),
            ArchiveKind::Raw => {
                let target = dest.join(file_name);
                debug!("Moving {:?} to {:?}", artifact, target);
                runtime
                    .rename(artifact, &target)
                    .or_else(|_| runtime.copy(artifact, &target).map(|_| ()))
                    .with_context(|| format!("Failed to move {:?} to {:?}", artifact, target))?;
                runtime.set_permissions(&target, 0o755)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{create_tar_gz, create_zip};
    use super::*;
    use crate::runtime::RealRuntime;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_archive_kind_from_uri() {
        assert_eq!(ArchiveKind::from_uri("https://host/jq-1.6.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::from_uri("https://host/jq-1.6.ZIP"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::from_uri("https://host/jdk.tar.gz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::from_uri("https://host/jdk.tar.gz?sig=abc"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::from_uri("https://host/gte-linux-amd64"), ArchiveKind::Raw);
        assert_eq!(ArchiveKind::from_uri("https://host/python.tgz"), ArchiveKind::Raw);
    }

    #[test]
    fn test_unpack_dispatches_to_tar_gz() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("test.tar.gz");
        let dest = dir.path().join("out");
        create_tar_gz(&archive_path, &[("bin/tool", "tool")])?;

        Unpacker::new().unpack(&RealRuntime, ArchiveKind::TarGz, &archive_path, &dest, "test.tar.gz")?;

        assert_eq!(fs::read_to_string(dest.join("bin/tool"))?, "tool");
        Ok(())
    }

    #[test]
    fn test_unpack_dispatches_to_zip() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("test.zip");
        let dest = dir.path().join("out");
        create_zip(&archive_path, &[("x-pack-7.2.0.zip", "bundle")])?;

        Unpacker::new().unpack(&RealRuntime, ArchiveKind::Zip, &archive_path, &dest, "test.zip")?;

        assert_eq!(fs::read_to_string(dest.join("x-pack-7.2.0.zip"))?, "bundle");
        Ok(())
    }

    #[test]
    fn test_unpack_raw_moves_file_into_place() -> Result<()> {
        let dir = tempdir()?;
        let artifact = dir.path().join("download");
        let dest = dir.path().join("gte-1.0.0");
        fs::write(&artifact, "binary")?;

        Unpacker::new().unpack(&RealRuntime, ArchiveKind::Raw, &artifact, &dest, "gte")?;

        assert!(!artifact.exists());
        assert_eq!(fs::read_to_string(dest.join("gte"))?, "binary");
        Ok(())
    }

    #[test]
    fn test_unpack_corrupt_archive_fails() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("broken.tar.gz");
        fs::write(&artifact, "not gzip").unwrap();

        let result = Unpacker::new().unpack(
            &RealRuntime,
            ArchiveKind::TarGz,
            &artifact,
            &dir.path().join("out"),
            "broken.tar.gz",
        );
        assert!(result.is_err());
    }
}
