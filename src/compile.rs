//! configure / make / make install for dependencies shipped as source.

use anyhow::Result;
use log::info;
use std::path::Path;

use crate::config::StepOutput;
use crate::error::{CompileStep, SupplyError};
use crate::process::{CommandRunner, CommandSpec};

/// Parallel jobs passed to `make`.
pub const MAKE_JOBS: u32 = 8;

/// Command for one step, run from `source_dir`.
pub fn step_command(step: CompileStep, source_dir: &Path, prefix: &Path, configure_args: &[String]) -> CommandSpec {
    let spec = match step {
        CompileStep::Configure => CommandSpec::new("/bin/sh")
            .arg(source_dir.join("configure").to_string_lossy())
            .arg(format!("--prefix={}", prefix.display()))
            .args(configure_args.iter().cloned()),
        CompileStep::Make => CommandSpec::new("make").args(["-j".to_string(), MAKE_JOBS.to_string()]),
        CompileStep::Install => CommandSpec::new("make").arg("install"),
    };
    spec.current_dir(source_dir)
}

/// Build the source tree at `source_dir` and install it under `prefix`.
///
/// Steps run strictly in order; the first failing step stops the build.
#[tracing::instrument(skip(runner, configure_args))]
pub async fn compile<C: CommandRunner + ?Sized>(
    runner: &C,
    dependency: &str,
    source_dir: &Path,
    prefix: &Path,
    configure_args: &[String],
    output: StepOutput,
) -> Result<()> {
    for step in CompileStep::ALL {
        info!("Compiling {}: {}", dependency, step);
        let spec = step_command(step, source_dir, prefix, configure_args);

        let exit = runner
            .run_streamed(&spec, output)
            .await
            .map_err(|e| SupplyError::Compile {
                dependency: dependency.to_string(),
                step,
                reason: format!("{:#}", e),
            })?;

        if !exit.success() {
            return Err(SupplyError::Compile {
                dependency: dependency.to_string(),
                step,
                reason: exit.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockCommandRunner, ProcessExit};
    use anyhow::anyhow;
    use std::path::PathBuf;

    fn exit(code: i32) -> ProcessExit {
        ProcessExit { code: Some(code) }
    }

    #[test]
    fn test_step_commands() {
        let src = Path::new("/tmp/extracted/python3-3.6.5/Python-3.6.5");
        let prefix = Path::new("/cache/v1/.python3-3.6.5.partial");

        let configure = step_command(CompileStep::Configure, src, prefix, &["--enable-shared".to_string()]);
        assert_eq!(configure.program, PathBuf::from("/bin/sh"));
        assert_eq!(
            configure.args,
            vec![
                "/tmp/extracted/python3-3.6.5/Python-3.6.5/configure".to_string(),
                "--prefix=/cache/v1/.python3-3.6.5.partial".to_string(),
                "--enable-shared".to_string(),
            ]
        );
        assert_eq!(configure.cwd.as_deref(), Some(src));

        assert_eq!(step_command(CompileStep::Make, src, prefix, &[]).to_string(), "make -j 8");
        assert_eq!(
            step_command(CompileStep::Install, src, prefix, &[]).to_string(),
            "make install"
        );
    }

    #[tokio::test]
    async fn test_configure_failure_short_circuits() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streamed()
            .withf(|spec, _| spec.program == Path::new("/bin/sh"))
            .times(1)
            .returning(|_, _| Ok(exit(1)));
        runner
            .expect_run_streamed()
            .withf(|spec, _| spec.program == Path::new("make"))
            .never();

        let err = compile(
            &runner,
            "python3",
            Path::new("/src"),
            Path::new("/prefix"),
            &[],
            StepOutput::Quiet,
        )
        .await
        .unwrap_err();

        match err.downcast_ref::<SupplyError>() {
            Some(SupplyError::Compile { dependency, step, .. }) => {
                assert_eq!(dependency, "python3");
                assert_eq!(*step, CompileStep::Configure);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_make_install_failure_is_tagged() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streamed()
            .withf(|spec, _| spec.args.first().map(String::as_str) != Some("install"))
            .times(2)
            .returning(|_, _| Ok(exit(0)));
        runner
            .expect_run_streamed()
            .withf(|spec, _| spec.args.first().map(String::as_str) == Some("install"))
            .times(1)
            .returning(|_, _| Ok(exit(2)));

        let err = compile(
            &runner,
            "python3",
            Path::new("/src"),
            Path::new("/prefix"),
            &[],
            StepOutput::Quiet,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SupplyError>(),
            Some(SupplyError::Compile { step: CompileStep::Install, .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_compile_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_streamed()
            .times(1)
            .returning(|_, _| Err(anyhow!("No such file or directory")));

        let err = compile(
            &runner,
            "python3",
            Path::new("/src"),
            Path::new("/prefix"),
            &[],
            StepOutput::Quiet,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SupplyError>(),
            Some(SupplyError::Compile { step: CompileStep::Configure, .. })
        ));
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let mut seq = mockall::Sequence::new();
        let mut runner = MockCommandRunner::new();
        for expected in ["/bin/sh", "make -j 8", "make install"] {
            runner
                .expect_run_streamed()
                .withf(move |spec, output| {
                    *output == StepOutput::Verbose
                        && (spec.to_string() == expected || spec.program == Path::new(expected))
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(exit(0)));
        }

        compile(
            &runner,
            "python3",
            Path::new("/src"),
            Path::new("/prefix"),
            &[],
            StepOutput::Verbose,
        )
        .await
        .unwrap();
    }
}
