//! Dependency metadata service backed by a buildpack `manifest.yml`.
//!
//! The manifest maps `(name, version)` to a download URI and checksum, names
//! a default version per dependency, and lists deprecation dates used for
//! end-of-life advisories.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use log::{debug, info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::http::HttpClient;
use crate::runtime::Runtime;
use crate::version::{VersionResolver, parse_lenient};

/// Days before a deprecation date at which the end-of-life advisory starts.
const END_OF_LIFE_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub version: String,
    pub uri: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub cf_stacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DefaultVersion {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeprecationDate {
    pub name: String,
    pub version_line: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub default_versions: Vec<DefaultVersion>,
    #[serde(default)]
    pub dependency_deprecation_dates: Vec<DeprecationDate>,
    #[serde(default)]
    pub dependencies: Vec<ManifestEntry>,
}

impl ManifestFile {
    pub fn parse(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Failed to parse manifest")
    }
}

/// Opaque dependency-metadata service consumed by the installer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Manifest: Send + Sync {
    /// Version specifier to use when none was configured.
    fn default_version(&self, name: &str) -> Result<String>;

    /// All versions the manifest offers for `name`.
    fn all_versions(&self, name: &str) -> Vec<String>;

    fn entry(&self, name: &str, version: &str) -> Result<ManifestEntry>;

    /// Retrieve the artifact for `(name, version)` into the file `dest`.
    async fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<()>;

    /// Log an advisory when a newer patch of the same minor line exists.
    fn warn_newer_patch(&self, name: &str, version: &str);

    /// Log an advisory when the version line is deprecated or about to be.
    fn warn_end_of_life(&self, name: &str, version: &str);
}

pub struct YamlManifest<R: Runtime> {
    runtime: Arc<R>,
    http_client: HttpClient,
    file: ManifestFile,
    today: NaiveDate,
    stack: Option<String>,
}

impl<R: Runtime + 'static> YamlManifest<R> {
    /// Load `<buildpack_dir>/manifest.yml`.
    #[tracing::instrument(skip(runtime, http_client))]
    pub fn load(runtime: Arc<R>, http_client: HttpClient, buildpack_dir: &Path) -> Result<Self> {
        let path = buildpack_dir.join("manifest.yml");
        let contents = runtime
            .read_to_string(&path)
            .with_context(|| format!("Failed to read manifest at {:?}", path))?;
        let file = ManifestFile::parse(&contents)
            .with_context(|| format!("Invalid manifest at {:?}", path))?;
        debug!("Loaded manifest with {} dependencies", file.dependencies.len());
        Ok(Self::new(runtime, http_client, file))
    }

    pub fn new(runtime: Arc<R>, http_client: HttpClient, file: ManifestFile) -> Self {
        Self {
            runtime,
            http_client,
            file,
            today: chrono::Local::now().date_naive(),
            stack: None,
        }
    }

    /// Only consider entries built for `stack`, plus stack-independent ones.
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.filter(|s| !s.is_empty());
        self
    }

    /// Pin the date used for end-of-life advisories.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    fn entries<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a ManifestEntry> + use<'a, 'b, R> {
        self.file
            .dependencies
            .iter()
            .filter(move |d| d.name == name)
            .filter(move |d| match &self.stack {
                Some(stack) => d.cf_stacks.is_empty() || d.cf_stacks.contains(stack),
                None => true,
            })
    }

    fn find_entry(&self, name: &str, version: &str) -> Option<&ManifestEntry> {
        self.entries(name).find(|d| d.version == version)
    }

    /// Newest version of the same major.minor line above `version`, if any.
    pub fn newer_patch(&self, name: &str, version: &str) -> Option<String> {
        let current = parse_lenient(version)?;
        let line = format!("{}.{}.x", current.major, current.minor);
        let candidates = self.all_versions(name);
        let newest = VersionResolver::find_matching(&line, &candidates)?;
        let newest_parsed = parse_lenient(&newest)?;
        (newest_parsed > current).then_some(newest)
    }

    /// Deprecation entry covering `version` whose warning window has opened.
    pub fn end_of_life(&self, name: &str, version: &str) -> Option<&DeprecationDate> {
        let parsed = parse_lenient(version)?;
        self.file
            .dependency_deprecation_dates
            .iter()
            .filter(|d| d.name == name)
            .filter(|d| VersionResolver::matches(&d.version_line, &parsed))
            .find(|d| d.date - Duration::days(END_OF_LIFE_WARNING_DAYS) <= self.today)
    }

    fn fetch_local(&self, source: &Path, dest: &Path) -> Result<()> {
        debug!("Copying local artifact {:?} to {:?}", source, dest);
        self.runtime
            .copy(source, dest)
            .with_context(|| format!("Failed to copy {:?}", source))?;
        Ok(())
    }

    fn verify_checksum(&self, path: &Path, expected: &str) -> Result<()> {
        let mut reader = self.runtime.open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            bail!("checksum mismatch: expected {}, got {}", expected, actual);
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Runtime + 'static> Manifest for YamlManifest<R> {
    fn default_version(&self, name: &str) -> Result<String> {
        let defaults: Vec<&DefaultVersion> = self
            .file
            .default_versions
            .iter()
            .filter(|d| d.name == name)
            .collect();

        match defaults.as_slice() {
            [single] => Ok(single.version.clone()),
            [] => Err(anyhow!("No default version for {} in manifest", name)),
            _ => Err(anyhow!("Multiple default versions for {} in manifest", name)),
        }
    }

    fn all_versions(&self, name: &str) -> Vec<String> {
        let mut versions: Vec<String> = Vec::new();
        for entry in self.entries(name) {
            if !versions.contains(&entry.version) {
                versions.push(entry.version.clone());
            }
        }
        versions
    }

    fn entry(&self, name: &str, version: &str) -> Result<ManifestEntry> {
        self.find_entry(name, version)
            .cloned()
            .ok_or_else(|| anyhow!("Dependency {} {} not found in manifest", name, version))
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(&self, name: &str, version: &str, dest: &Path) -> Result<()> {
        let entry = self.entry(name, version)?;
        info!("Downloading {} {} from {}", name, version, entry.uri);

        if let Some(parent) = dest.parent() {
            self.runtime.create_dir_all(parent)?;
        }

        if let Some(local) = entry.uri.strip_prefix("file://") {
            self.fetch_local(&PathBuf::from(local), dest)?;
        } else {
            let dest_path = dest.to_path_buf();
            self.http_client
                .download_file(&entry.uri, || {
                    self.runtime
                        .create_file(&dest_path)
                        .with_context(|| format!("Failed to create download file at {:?}", dest_path))
                })
                .await?;
        }

        if let Some(expected) = entry.sha256.as_deref().filter(|s| !s.is_empty())
            && let Err(e) = self.verify_checksum(dest, expected)
        {
            let _ = self.runtime.remove_file(dest);
            return Err(e.context(format!("Downloaded artifact for {} {} is invalid", name, version)));
        }

        Ok(())
    }

    fn warn_newer_patch(&self, name: &str, version: &str) {
        if let Some(newer) = self.newer_patch(name, version) {
            warn!(
                "A newer version of {} is available in this buildpack: {} (currently using {})",
                name, newer, version
            );
        }
    }

    fn warn_end_of_life(&self, name: &str, version: &str) {
        if let Some(eol) = self.end_of_life(name, version) {
            let link = eol
                .link
                .as_deref()
                .map(|l| format!(" See: {}", l))
                .unwrap_or_default();
            if eol.date <= self.today {
                warn!(
                    "{} {} reached end of life on {} and is no longer supported.{}",
                    name, eol.version_line, eol.date, link
                );
            } else {
                warn!(
                    "{} {} will no longer be available in new buildpacks released after {}.{}",
                    name, eol.version_line, eol.date, link
                );
            }
        }
    }
}
