//! The ordered dependency sequence of one supply run.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::certificate;
use crate::config::Config;
use crate::dependency::{Dependency, DependencyRequest, Layout};
use crate::error::SupplyError;
use crate::http::HttpClient;
use crate::installer::ArtifactInstaller;
use crate::manifest::{Manifest, YamlManifest};
use crate::plugin::{InstallTarget, PluginInstaller, PluginResolver, PluginSources};
use crate::process::{CommandRunner, CommandSpec, TokioCommandRunner};
use crate::runtime::Runtime;

pub const TEMPLATE_TOOL: &str = "gte";
pub const PYTHON: &str = "python3";
pub const RETENTION_TOOL: &str = "curator";
pub const JVM: &str = "openjdk";
pub const MAIN_RUNTIME: &str = "logstash";
pub const PREMIUM_BUNDLE: &str = "x-pack";
pub const DEFAULTS_BUNDLE: &str = "logstash-plugins";
/// Application directory holding user-supplied plugins.
pub const USER_PLUGINS_DIR: &str = "plugins";
pub const STAGED_CONFIG_FILE: &str = "config.yml";
/// Written to the temp root and run once the retention tool is staged.
pub const RETENTION_PACKAGES_SCRIPT: &str = "pip_install_curator.sh";
/// Pipeline templates in the application directory.
pub const PIPELINE_TEMPLATES_DIR: &str = "conf.d";
/// Rendered pipeline configuration in the staging directory.
pub const RENDERED_PIPELINE_DIR: &str = "logstash.conf.d";

const VERSION_PARTS: usize = 3;

/// Condition under which a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Always,
    Retention,
}

impl Gate {
    pub fn is_open(self, config: &Config) -> bool {
        match self {
            Gate::Always => true,
            Gate::Retention => config.retention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub request: DependencyRequest,
    pub gate: Gate,
}

impl Step {
    fn new(request: DependencyRequest, gate: Gate) -> Self {
        Self { request, gate }
    }
}

/// Tools installed before the main runtime, in installation order.
pub fn tool_steps() -> Vec<Step> {
    vec![
        Step::new(DependencyRequest::prebuilt(TEMPLATE_TOOL, "", VERSION_PARTS), Gate::Always),
        Step::new(DependencyRequest::prebuilt("jq", "", VERSION_PARTS), Gate::Always),
        Step::new(DependencyRequest::prebuilt("ofelia", "", VERSION_PARTS), Gate::Retention),
        Step::new(
            DependencyRequest::compiled(PYTHON, "", VERSION_PARTS, Vec::new()),
            Gate::Retention,
        ),
        Step::new(DependencyRequest::prebuilt(RETENTION_TOOL, "", VERSION_PARTS), Gate::Retention),
        Step::new(DependencyRequest::prebuilt(JVM, "", VERSION_PARTS), Gate::Always),
    ]
}

/// Values produced by earlier steps and read by later ones.
#[derive(Debug, Clone, Default)]
pub struct SupplyContext {
    pub template_tool_home: Option<PathBuf>,
    pub python_home: Option<PathBuf>,
    pub retention_tool_home: Option<PathBuf>,
    pub java_home: Option<PathBuf>,
    pub runtime_home: Option<PathBuf>,
    pub runtime_version: Option<String>,
    pub premium_bundle: Option<PathBuf>,
    pub defaults_bundle: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SupplyReport {
    pub installed: Vec<Dependency>,
    pub certificates: Vec<PathBuf>,
    pub plugins: Vec<(String, InstallTarget)>,
    /// Cache entries removed by the end-of-run sweep.
    pub swept: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StagedConfig {
    logstash_version: String,
}

pub struct Supplier<R: Runtime, M: Manifest, C: CommandRunner> {
    config: Config,
    runtime: Arc<R>,
    runner: Arc<C>,
    installer: ArtifactInstaller<R, M, C>,
}

impl<R: Runtime, M: Manifest, C: CommandRunner> Supplier<R, M, C> {
    pub fn new(config: Config, runtime: Arc<R>, runner: Arc<C>, installer: ArtifactInstaller<R, M, C>) -> Self {
        Self {
            config,
            runtime,
            runner,
            installer,
        }
    }

    /// Run every step in order. The first failure aborts the run; the cache
    /// is swept only after all steps succeed.
    #[tracing::instrument(skip(self, cache))]
    pub async fn supply(&self, cache: &mut CacheStore<R>) -> Result<SupplyReport> {
        let mut ctx = SupplyContext::default();
        let mut report = SupplyReport::default();

        for step in tool_steps() {
            if !step.gate.is_open(&self.config) {
                debug!("Skipping {}", step.request.name);
                continue;
            }
            let dependency = self.installer.install(cache, &step.request).await?;
            let home = Some(dependency.locations.staging.clone());
            match dependency.name.as_str() {
                TEMPLATE_TOOL => ctx.template_tool_home = home,
                PYTHON => ctx.python_home = home,
                RETENTION_TOOL => ctx.retention_tool_home = home,
                JVM => ctx.java_home = home,
                _ => {}
            }
            let retention_tool = dependency.name == RETENTION_TOOL;
            report.installed.push(dependency);

            if retention_tool {
                self.install_retention_packages(&ctx).await?;
            }
        }

        report.certificates =
            certificate::locate(self.runtime.as_ref(), &self.config.build_dir, &self.config.certificates)?;

        let request = DependencyRequest::prebuilt(MAIN_RUNTIME, &self.config.runtime_version, VERSION_PARTS);
        let runtime_dep = self.installer.install(cache, &request).await?;
        ctx.runtime_home = Some(runtime_dep.locations.staging.clone());
        ctx.runtime_version = Some(runtime_dep.version.clone());
        report.installed.push(runtime_dep);

        self.install_plugin_bundles(cache, &mut ctx, &mut report).await?;
        self.install_plugins(&ctx, &mut report).await?;

        if self.config.config_check {
            self.check_pipeline_config(&ctx).await?;
        }

        report.swept = cache.sweep();
        self.write_staged_config(&ctx)?;

        info!("Supplied {} dependencies", report.installed.len());
        Ok(report)
    }

    /// Offline bundles pinned to the main runtime's resolved version.
    async fn install_plugin_bundles(
        &self,
        cache: &mut CacheStore<R>,
        ctx: &mut SupplyContext,
        report: &mut SupplyReport,
    ) -> Result<()> {
        let plugins = &self.config.plugins;
        if plugins.is_empty() {
            return Ok(());
        }
        let version = ctx
            .runtime_version
            .clone()
            .context("Main runtime must be installed before plugin bundles")?;

        if plugins.iter().any(|p| p.starts_with(PREMIUM_BUNDLE)) {
            let request = DependencyRequest::prebuilt(PREMIUM_BUNDLE, &version, VERSION_PARTS);
            let dependency = self.installer.install(cache, &request).await?;
            ctx.premium_bundle = Some(dependency.locations.staging.clone());
            report.installed.push(dependency);
        }

        if plugins.iter().any(|p| !p.starts_with(PREMIUM_BUNDLE)) {
            let request = DependencyRequest::prebuilt(DEFAULTS_BUNDLE, &version, VERSION_PARTS);
            let dependency = self.installer.install(cache, &request).await?;
            ctx.defaults_bundle = Some(dependency.locations.staging.clone());
            report.installed.push(dependency);
        }
        Ok(())
    }

    async fn install_plugins(&self, ctx: &SupplyContext, report: &mut SupplyReport) -> Result<()> {
        let runtime_home = ctx
            .runtime_home
            .as_deref()
            .context("Main runtime must be installed before plugins")?;
        let java_home = ctx
            .java_home
            .as_deref()
            .context("JVM must be installed before plugins")?;
        let installer = PluginInstaller::new(Arc::clone(&self.runner), runtime_home, java_home);

        let mut plugins = self.config.plugins.clone();
        plugins.sort();
        plugins.dedup();

        if plugins.is_empty() {
            info!("No plugins to install");
        } else {
            let sources = PluginSources {
                premium: ctx.premium_bundle.clone(),
                defaults: ctx.defaults_bundle.clone(),
                user: Some(self.config.build_dir.join(USER_PLUGINS_DIR)),
            };
            let resolver = PluginResolver::new(self.runtime.as_ref());
            for plugin in plugins {
                let target = resolver.resolve(&plugin, &sources);
                installer.install(&plugin, &target).await?;
                report.plugins.push((plugin, target));
            }
        }

        let listing = installer.list().await?;
        info!("Installed plugins:");
        for line in listing.lines() {
            info!("  {}", line);
        }
        Ok(())
    }

    /// Install the retention tool's Python packages from the wheels it ships,
    /// without touching the network.
    async fn install_retention_packages(&self, ctx: &SupplyContext) -> Result<()> {
        let python_home = ctx
            .python_home
            .as_deref()
            .context("Python must be installed before the retention packages")?;
        let tool_home = ctx
            .retention_tool_home
            .as_deref()
            .context("Retention tool must be staged before its packages")?;

        let script = self.config.tmp_dir.join(RETENTION_PACKAGES_SCRIPT);
        let contents = retention_packages_script(python_home, tool_home, &self.config.staging_dir());
        self.runtime.create_dir_all(&self.config.tmp_dir)?;
        self.runtime
            .write(&script, contents.as_bytes())
            .with_context(|| format!("Failed to write {:?}", script))?;

        info!("Installing {} packages", RETENTION_TOOL);
        let helper_error = |reason: String| SupplyError::HelperScript {
            script: RETENTION_PACKAGES_SCRIPT.to_string(),
            reason,
        };
        let spec = CommandSpec::new("/bin/sh").arg(script.to_string_lossy());
        let exit = self
            .runner
            .run_streamed(&spec, self.config.step_output)
            .await
            .map_err(|e| helper_error(format!("{:#}", e)))?;
        if !exit.success() {
            return Err(helper_error(exit.to_string()).into());
        }
        Ok(())
    }

    /// Render the application's pipeline templates and let the runtime
    /// validate the result.
    #[tracing::instrument(skip(self, ctx))]
    async fn check_pipeline_config(&self, ctx: &SupplyContext) -> Result<()> {
        let tool_home = ctx
            .template_tool_home
            .as_deref()
            .context("Template tool must be installed before the config check")?;
        let runtime_home = ctx
            .runtime_home
            .as_deref()
            .context("Main runtime must be installed before the config check")?;
        let java_home = ctx
            .java_home
            .as_deref()
            .context("JVM must be installed before the config check")?;

        info!("Checking pipeline configuration");
        let templates = self.config.build_dir.join(PIPELINE_TEMPLATES_DIR);
        let rendered = self.config.staging_dir().join(RENDERED_PIPELINE_DIR);

        let render = CommandSpec::new(tool_home.join(TEMPLATE_TOOL))
            .arg(templates.to_string_lossy())
            .arg(rendered.to_string_lossy());
        self.run_check_step(&render).await?;

        let files = self
            .runtime
            .read_dir(&rendered)
            .with_context(|| format!("Failed to list {:?}", rendered))?;
        if files.is_empty() {
            warn!("No pipeline configuration files in {:?}", rendered);
        }
        for file in &files {
            if let Some(name) = file.file_name() {
                info!("  {}", name.to_string_lossy());
            }
        }

        let check = CommandSpec::new(runtime_home.join("bin").join(MAIN_RUNTIME))
            .arg("-f")
            .arg(rendered.to_string_lossy())
            .arg("-t")
            .env("JAVA_HOME", java_home.to_string_lossy());
        let output = self.run_check_step(&check).await?;
        for line in output.lines() {
            info!("  {}", line);
        }
        Ok(())
    }

    async fn run_check_step(&self, spec: &CommandSpec) -> Result<String> {
        let captured = self
            .runner
            .run_captured(spec)
            .await
            .map_err(|e| SupplyError::ConfigCheck {
                output: format!("{:#}", e),
            })?;
        if !captured.exit.success() {
            return Err(SupplyError::ConfigCheck {
                output: captured.combined,
            }
            .into());
        }
        Ok(captured.combined)
    }

    fn write_staged_config(&self, ctx: &SupplyContext) -> Result<()> {
        let staged = StagedConfig {
            logstash_version: ctx.runtime_version.clone().unwrap_or_default(),
        };
        let staging_dir = self.config.staging_dir();
        self.runtime.create_dir_all(&staging_dir)?;
        let path = staging_dir.join(STAGED_CONFIG_FILE);
        let contents = serde_yaml::to_string(&staged).context("Failed to serialize staged config")?;
        self.runtime
            .write(&path, contents.as_bytes())
            .with_context(|| format!("Failed to write {:?}", path))?;
        debug!("Wrote {:?}", path);
        Ok(())
    }
}

fn retention_packages_script(python_home: &Path, tool_home: &Path, staging_dir: &Path) -> String {
    format!(
        "set -e\n\
         export PATH={python}/bin:$PATH\n\
         pip3 install --no-index --find-links {tool}/dependencies --install-option=\"--prefix={staging}/curator\" elasticsearch-curator -v\n\
         pip3 list\n",
        python = python_home.display(),
        tool = tool_home.display(),
        staging = staging_dir.display(),
    )
}

/// Supply every dependency `config` asks for, using the manifest under
/// `config.buildpack_dir` and the cache under `config.cache_dir`.
#[tracing::instrument(skip(runtime, config))]
pub async fn run<R: Runtime + 'static>(runtime: Arc<R>, config: Config) -> Result<SupplyReport> {
    let client = Client::builder().user_agent("stagehand").build()?;
    let manifest = YamlManifest::load(Arc::clone(&runtime), HttpClient::new(client), &config.buildpack_dir)?
        .with_stack(config.stack.clone());

    let mut cache = CacheStore::open(
        Arc::clone(&runtime),
        &config.cache_dir,
        &config.cache_format_version,
        config.no_cache,
    )?;
    let layout = Layout::from_config(&config, cache.dir());

    let runner = Arc::new(TokioCommandRunner);
    let installer = ArtifactInstaller::new(Arc::clone(&runtime), Arc::new(manifest), Arc::clone(&runner), layout)
        .with_persistent_cache(!config.no_cache)
        .with_step_output(config.step_output);

    Supplier::new(config, runtime, runner, installer)
        .supply(&mut cache)
        .await
}
