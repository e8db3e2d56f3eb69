//! Executable resolution. Names with a slash are tried directly; bare names
//! go through the $PATH search. The sandbox core wants an absolute path to
//! an executable regular file, so the result is canonicalized.

use anyhow::{bail, Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub fn resolve(name: &str) -> Result<PathBuf> {
    let found = if name.contains('/') {
        let path = PathBuf::from(name);
        check_executable(&path).with_context(|| format!("cannot execute {name:?}"))?;
        path
    } else {
        which::which(name).with_context(|| format!("{name:?} not found in $PATH"))?
    };
    std::fs::canonicalize(&found).with_context(|| format!("cannot resolve {found:?}"))
}

fn check_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        bail!("is a directory");
    }
    if meta.permissions().mode() & 0o111 == 0 {
        bail!("no execute bit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn absolute_paths_resolve_directly() {
        let path = resolve("/bin/sh").unwrap();
        assert!(path.is_absolute());
    }

    #[test]
    fn bare_names_search_the_path() {
        let path = resolve("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.to_string_lossy().contains("sh"));
    }

    #[test]
    fn missing_programs_are_an_error() {
        assert!(resolve("no-such-program-judgebox").is_err());
        assert!(resolve("/no/such/program").is_err());
    }

    #[test]
    fn directories_are_not_executables() {
        assert!(resolve("/tmp").is_err());
    }

    #[test]
    fn files_without_an_execute_bit_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(path.contains('/'));
        assert!(resolve(&path).is_err());
    }
}
