//! Plugin resolution across offline bundles, and the runtime's plugin installer.

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SupplyError;
use crate::process::{CommandRunner, CommandSpec};
use crate::runtime::Runtime;

/// Directories searched for offline plugin artifacts, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginSources {
    /// Extended feature set bundle.
    pub premium: Option<PathBuf>,
    /// Default plugins bundle matching the runtime version.
    pub defaults: Option<PathBuf>,
    /// Plugins shipped with the application.
    pub user: Option<PathBuf>,
}

impl PluginSources {
    pub fn in_priority_order(&self) -> impl Iterator<Item = &Path> {
        [&self.premium, &self.defaults, &self.user]
            .into_iter()
            .filter_map(|dir| dir.as_deref())
    }
}

/// What gets handed to `logstash-plugin install`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallTarget {
    LocalPath(PathBuf),
    /// Zip bundles, which the installer only accepts as `file://` URIs.
    FileUri(String),
    /// Not found offline; the installer fetches it by name.
    Online(String),
}

impl InstallTarget {
    pub fn as_arg(&self) -> String {
        match self {
            InstallTarget::LocalPath(path) => path.to_string_lossy().into_owned(),
            InstallTarget::FileUri(uri) => uri.clone(),
            InstallTarget::Online(name) => name.clone(),
        }
    }

    pub fn is_offline(&self) -> bool {
        !matches!(self, InstallTarget::Online(_))
    }
}

impl fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_arg())
    }
}

pub struct PluginResolver<'a, R: Runtime> {
    runtime: &'a R,
}

impl<'a, R: Runtime> PluginResolver<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    /// Pick the install target for `plugin`.
    ///
    /// The first source holding an entry whose file name starts with
    /// `plugin` wins. Entries are compared in sorted order.
    pub fn resolve(&self, plugin: &str, sources: &PluginSources) -> InstallTarget {
        for dir in sources.in_priority_order() {
            if let Some(found) = self.find_in(dir, plugin) {
                debug!("Resolved plugin {} to {:?}", plugin, found);
                return Self::target_for(found);
            }
        }
        debug!("Plugin {} not found offline, installing by name", plugin);
        InstallTarget::Online(plugin.to_string())
    }

    fn find_in(&self, dir: &Path, plugin: &str) -> Option<PathBuf> {
        if !self.runtime.is_dir(dir) {
            return None;
        }
        let mut entries = match self.runtime.read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list plugin directory {:?}: {:#}", dir, e);
                return None;
            }
        };
        entries.sort();
        entries.into_iter().find(|entry| {
            entry
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(plugin))
        })
    }

    fn target_for(path: PathBuf) -> InstallTarget {
        let is_zip = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if is_zip {
            InstallTarget::FileUri(format!("file://{}", path.display()))
        } else {
            InstallTarget::LocalPath(path)
        }
    }
}

/// Runs `<runtime>/bin/logstash-plugin` with the staged JVM.
pub struct PluginInstaller<C: CommandRunner> {
    runner: Arc<C>,
    runtime_home: PathBuf,
    java_home: PathBuf,
}

impl<C: CommandRunner> PluginInstaller<C> {
    pub fn new(runner: Arc<C>, runtime_home: &Path, java_home: &Path) -> Self {
        Self {
            runner,
            runtime_home: runtime_home.to_path_buf(),
            java_home: java_home.to_path_buf(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(self.runtime_home.join("bin").join("logstash-plugin"))
            .env("JAVA_HOME", self.java_home.to_string_lossy())
    }

    #[tracing::instrument(skip(self))]
    pub async fn install(&self, plugin: &str, target: &InstallTarget) -> Result<()> {
        if target.is_offline() {
            info!("Installing plugin {} from {}", plugin, target);
        } else {
            info!("Installing plugin {} online", plugin);
        }
        let spec = self.command().arg("install").arg(target.as_arg());

        let captured = self
            .runner
            .run_captured(&spec)
            .await
            .map_err(|e| SupplyError::PluginInstall {
                plugin: plugin.to_string(),
                output: format!("{:#}", e),
            })?;

        if !captured.exit.success() {
            return Err(SupplyError::PluginInstall {
                plugin: plugin.to_string(),
                output: captured.combined,
            }
            .into());
        }
        debug!("{}", captured.combined);
        Ok(())
    }

    /// Installed plugins with their versions, as reported by the runtime.
    pub async fn list(&self) -> Result<String> {
        let spec = self.command().arg("list").arg("--verbose");
        let captured = self
            .runner
            .run_captured(&spec)
            .await
            .context("Failed to list installed plugins")?;
        if !captured.exit.success() {
            bail!(
                "Listing plugins failed with {}:\n{}",
                captured.exit,
                captured.combined
            );
        }
        Ok(captured.combined)
    }
}
