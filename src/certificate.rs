use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};

use crate::error::SupplyError;
use crate::runtime::Runtime;

/// Certificates ship with the application under this directory.
pub const CERTIFICATES_DIR: &str = "certificates";

/// Locate `<build_dir>/certificates/<name>.crt` for every requested name.
pub fn locate<R: Runtime + ?Sized>(runtime: &R, build_dir: &Path, names: &[String]) -> Result<Vec<PathBuf>> {
    let dir = build_dir.join(CERTIFICATES_DIR);
    let mut found = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(format!("{}.crt", name));
        if !runtime.exists(&path) {
            return Err(SupplyError::CertificateMissing {
                name: name.clone(),
                dir: dir.clone(),
            }
            .into());
        }
        info!("Found certificate {:?}", path);
        found.push(path);
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use mockall::predicate::eq;

    #[test]
    fn test_locate_all_present() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| true);

        let found = locate(&runtime, Path::new("/app"), &["ca".to_string(), "es".to_string()]).unwrap();

        assert_eq!(
            found,
            vec![
                PathBuf::from("/app/certificates/ca.crt"),
                PathBuf::from("/app/certificates/es.crt"),
            ]
        );
    }

    #[test]
    fn test_missing_certificate_is_fatal() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_exists()
            .with(eq(PathBuf::from("/app/certificates/ca.crt")))
            .returning(|_| false);

        let err = locate(&runtime, Path::new("/app"), &["ca".to_string()]).unwrap_err();

        match err.downcast_ref::<SupplyError>() {
            Some(SupplyError::CertificateMissing { name, dir }) => {
                assert_eq!(name, "ca");
                assert_eq!(dir, Path::new("/app/certificates"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_no_certificates_requested() {
        let runtime = MockRuntime::new();
        assert!(locate(&runtime, Path::new("/app"), &[]).unwrap().is_empty());
    }
}
