use anyhow::Result;
use clap::Parser;
use log::info;
use stagehand::config::DEFAULT_CACHE_FORMAT_VERSION;
use stagehand::runtime::RealRuntime;
use stagehand::{Config, StepOutput};
use std::path::PathBuf;
use std::sync::Arc;

/// stagehand - dependency supply for staged applications
///
/// Resolves the runtime stack against the buildpack manifest, reusing the
/// application cache across builds, and stages it under DEPS_DIR/DEPS_IDX.
///
/// Examples:
///   stagehand supply /tmp/app /tmp/cache /tmp/deps 0 --runtime-version 7
#[derive(Parser, Debug)]
#[command(author, version = env!("STAGEHAND_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level and stream build step output
    #[arg(long, env = "STAGEHAND_DEBUG", global = true)]
    debug: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install every dependency into the staging directory
    Supply(SupplyArgs),
}

#[derive(clap::Args, Debug)]
struct SupplyArgs {
    #[arg(value_name = "BUILD_DIR")]
    build_dir: PathBuf,

    #[arg(value_name = "CACHE_DIR")]
    cache_dir: PathBuf,

    #[arg(value_name = "DEPS_DIR")]
    deps_dir: PathBuf,

    #[arg(value_name = "DEPS_IDX")]
    deps_idx: String,

    /// Directory containing manifest.yml
    #[arg(long, env = "STAGEHAND_BUILDPACK_DIR", value_name = "PATH", default_value = ".")]
    buildpack_dir: PathBuf,

    /// Clear the cache and keep nothing for the next build
    #[arg(long, env = "STAGEHAND_NO_CACHE")]
    no_cache: bool,

    /// Install the scheduler and log retention tooling
    #[arg(long, env = "STAGEHAND_RETENTION")]
    retention: bool,

    /// Version of the main runtime, e.g. "7" or "7.2.0" (manifest default if empty)
    #[arg(long, env = "STAGEHAND_RUNTIME_VERSION", value_name = "VERSION", default_value = "")]
    runtime_version: String,

    /// Plugin to install (repeatable or comma separated)
    #[arg(long = "plugin", env = "STAGEHAND_PLUGINS", value_name = "NAME", value_delimiter = ',')]
    plugins: Vec<String>,

    /// Certificate name expected as certificates/<NAME>.crt in the build dir
    #[arg(long = "certificate", env = "STAGEHAND_CERTIFICATES", value_name = "NAME", value_delimiter = ',')]
    certificates: Vec<String>,

    /// Check the rendered pipeline configuration before finishing
    #[arg(long, env = "STAGEHAND_CONFIG_CHECK")]
    config_check: bool,

    /// Only use manifest entries built for this stack
    #[arg(long, env = "CF_STACK", value_name = "STACK")]
    stack: Option<String>,

    /// Cache layout tag; changing it invalidates the cache
    #[arg(long, env = "STAGEHAND_CACHE_FORMAT", value_name = "TAG", default_value = DEFAULT_CACHE_FORMAT_VERSION)]
    cache_format: String,
}

impl SupplyArgs {
    fn into_config(self, runtime: &RealRuntime, debug: bool) -> Config {
        let mut config = Config::new(
            runtime,
            self.build_dir,
            self.cache_dir,
            self.deps_dir,
            self.deps_idx,
            self.buildpack_dir,
        );
        config.cache_format_version = self.cache_format;
        config.no_cache = self.no_cache;
        config.retention = self.retention;
        config.runtime_version = self.runtime_version;
        config.plugins = self.plugins;
        config.certificates = self.certificates;
        config.config_check = self.config_check;
        config.stack = self.stack;
        config.step_output = if debug {
            StepOutput::Verbose
        } else {
            StepOutput::Quiet
        };
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let runtime = RealRuntime;
    match cli.command {
        Commands::Supply(args) => {
            let config = args.into_config(&runtime, cli.debug);
            let report = stagehand::run(Arc::new(runtime), config).await?;
            info!(
                "Staged {} dependencies, {} plugins, removed {} unused cache entries",
                report.installed.len(),
                report.plugins.len(),
                report.swept.len()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn supply_args(cli: Cli) -> SupplyArgs {
        match cli.command {
            Commands::Supply(args) => args,
        }
    }

    #[test]
    fn test_cli_supply_parsing() {
        let cli = Cli::try_parse_from(["stagehand", "supply", "/app", "/cache", "/deps", "0"]).unwrap();
        assert!(!cli.debug);
        let args = supply_args(cli);
        assert_eq!(args.build_dir, PathBuf::from("/app"));
        assert_eq!(args.cache_dir, PathBuf::from("/cache"));
        assert_eq!(args.deps_dir, PathBuf::from("/deps"));
        assert_eq!(args.deps_idx, "0");
        assert_eq!(args.cache_format, "v1");
        assert!(args.runtime_version.is_empty());
        assert!(args.plugins.is_empty());
    }

    #[test]
    fn test_cli_plugins_are_repeatable_and_comma_separated() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "supply",
            "/app",
            "/cache",
            "/deps",
            "0",
            "--plugin",
            "x-pack,logstash-filter-foo",
            "--plugin",
            "logstash-output-bar",
        ])
        .unwrap();
        assert_eq!(
            supply_args(cli).plugins,
            vec!["x-pack", "logstash-filter-foo", "logstash-output-bar"]
        );
    }

    #[test]
    fn test_cli_into_config() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "--debug",
            "supply",
            "/app",
            "/cache",
            "/deps",
            "3",
            "--no-cache",
            "--retention",
            "--runtime-version",
            "7",
            "--certificate",
            "ca",
            "--config-check",
            "--stack",
            "cflinuxfs4",
        ])
        .unwrap();
        let debug = cli.debug;
        let config = supply_args(cli).into_config(&RealRuntime, debug);

        assert!(config.no_cache);
        assert!(config.retention);
        assert_eq!(config.runtime_version, "7");
        assert_eq!(config.certificates, vec!["ca"]);
        assert!(config.config_check);
        assert_eq!(config.stack.as_deref(), Some("cflinuxfs4"));
        assert_eq!(config.step_output, StepOutput::Verbose);
        assert_eq!(config.staging_dir(), PathBuf::from("/deps/3"));
    }

    #[test]
    fn test_cli_missing_arguments_fails() {
        assert!(Cli::try_parse_from(["stagehand", "supply", "/app"]).is_err());
        assert!(Cli::try_parse_from(["stagehand"]).is_err());
    }
}
