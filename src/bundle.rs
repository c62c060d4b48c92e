//! The bundled resources directory: compose file, Makefile and scripts.

use crate::error::DistroLabError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const COMPOSE_MARKER: &str = "docker-compose.yml";
const CODE_DIR: &str = "code";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BundleValidation {
    pub bundle_dir: PathBuf,
    pub missing: Vec<String>,
}

impl BundleValidation {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn into_result(self) -> Result<PathBuf, DistroLabError> {
        if self.is_valid() {
            return Ok(self.bundle_dir);
        }
        Err(DistroLabError::Config(format!(
            "bundle directory {} is incomplete. Missing: {}. Point `distrolab config path --set` at a complete installation.",
            self.bundle_dir.display(),
            self.missing.join(", ")
        )))
    }
}

pub fn validate_bundle(bundle_dir: &Path, scripts_dir: &str) -> BundleValidation {
    let mut missing = Vec::new();
    if !bundle_dir.join(COMPOSE_MARKER).is_file() {
        missing.push(COMPOSE_MARKER.to_string());
    }
    if !bundle_dir.join("Makefile").is_file() {
        missing.push("Makefile".to_string());
    }
    if !bundle_dir.join(scripts_dir).is_dir() {
        missing.push(format!("{scripts_dir} directory"));
    }
    BundleValidation {
        bundle_dir: bundle_dir.to_path_buf(),
        missing,
    }
}

fn looks_like_bundle(dir: &Path) -> bool {
    dir.join(COMPOSE_MARKER).is_file()
}

/// Searches next to the executable (and its `bundled/` child), then the
/// working directory and its ancestors, for a directory holding
/// `docker-compose.yml`.
pub fn detect_bundle_dir(exe: Option<&Path>, cwd: Option<&Path>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut push_candidate = |candidate: PathBuf| {
        if !candidates.iter().any(|existing| existing == &candidate) {
            candidates.push(candidate);
        }
    };

    if let Some(exe) = exe {
        let resolved = fs::canonicalize(exe).unwrap_or_else(|_| exe.to_path_buf());
        if let Some(parent) = resolved.parent() {
            push_candidate(parent.join("bundled"));
            push_candidate(parent.to_path_buf());
            if let Some(grandparent) = parent.parent() {
                push_candidate(grandparent.join("bundled"));
            }
        }
    }
    if let Some(cwd) = cwd {
        for ancestor in cwd.ancestors() {
            push_candidate(ancestor.join("bundled"));
            push_candidate(ancestor.to_path_buf());
        }
    }

    let found = candidates.into_iter().find(|candidate| looks_like_bundle(candidate));
    debug!(?found, "bundle auto-detection");
    found
}

/// Copies `source` into `<bundle>/code/` and returns the bundle-relative path
/// the scripts expect, e.g. `code/main.c`.
pub fn prepare_source_file(bundle_dir: &Path, source: &Path) -> Result<String, DistroLabError> {
    if !source.is_file() {
        return Err(DistroLabError::Config(format!(
            "source file not found: {}",
            source.display()
        )));
    }
    let file_name = source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            DistroLabError::Config(format!("not a file path: {}", source.display()))
        })?;
    let code_dir = bundle_dir.join(CODE_DIR);
    fs::create_dir_all(&code_dir)?;
    let destination = code_dir.join(&file_name);

    let same_file = match (fs::canonicalize(source), fs::canonicalize(&destination)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_file {
        fs::copy(source, &destination)?;
    }
    Ok(format!("{CODE_DIR}/{file_name}"))
}

/// Environment for the automation scripts: unbuffered, no colors, no rc files.
pub fn script_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env.insert("TERM".to_string(), "dumb".to_string());
    env.insert("BASH_ENV".to_string(), String::new());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_bundle(dir: &Path) {
        fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
        fs::write(dir.join("Makefile"), "setup:\n\ttrue\n").unwrap();
        fs::create_dir_all(dir.join("scripts")).unwrap();
    }

    #[test]
    fn complete_bundle_validates() {
        let dir = tempdir().unwrap();
        write_bundle(dir.path());
        let validation = validate_bundle(dir.path(), "scripts");
        assert!(validation.is_valid());
        assert_eq!(validation.into_result().unwrap(), dir.path());
    }

    #[test]
    fn missing_items_are_listed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), "").unwrap();
        let validation = validate_bundle(dir.path(), "scripts");
        assert_eq!(
            validation.missing,
            vec!["docker-compose.yml".to_string(), "scripts directory".to_string()]
        );
        let err = validation.into_result().unwrap_err();
        assert!(err.to_string().contains("docker-compose.yml, scripts directory"));
    }

    #[test]
    fn detects_bundled_child_of_working_dir_ancestor() {
        let dir = tempdir().unwrap();
        let bundled = dir.path().join("bundled");
        fs::create_dir_all(&bundled).unwrap();
        write_bundle(&bundled);
        let nested = dir.path().join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(detect_bundle_dir(None, Some(&nested)), Some(bundled));
    }

    #[test]
    fn detects_bundle_next_to_executable() {
        let dir = tempdir().unwrap();
        write_bundle(dir.path());
        let exe = dir.path().join("distrolab");
        fs::write(&exe, "").unwrap();
        let detected = detect_bundle_dir(Some(&exe), None).unwrap();
        assert_eq!(
            fs::canonicalize(detected).unwrap(),
            fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[test]
    fn detection_fails_without_compose_file() {
        let dir = tempdir().unwrap();
        assert_eq!(detect_bundle_dir(None, Some(dir.path())), None);
    }

    #[test]
    fn source_file_is_copied_into_code_dir() {
        let bundle = tempdir().unwrap();
        let work = tempdir().unwrap();
        let source = work.path().join("hello.c");
        fs::write(&source, "int main(void) { return 0; }\n").unwrap();
        let relative = prepare_source_file(bundle.path(), &source).unwrap();
        assert_eq!(relative, "code/hello.c");
        let copied = fs::read_to_string(bundle.path().join("code").join("hello.c")).unwrap();
        assert!(copied.contains("int main"));
    }

    #[test]
    fn source_already_in_code_dir_is_left_alone() {
        let bundle = tempdir().unwrap();
        let code_dir = bundle.path().join("code");
        fs::create_dir_all(&code_dir).unwrap();
        let source = code_dir.join("inplace.c");
        fs::write(&source, "keep me\n").unwrap();
        let relative = prepare_source_file(bundle.path(), &source).unwrap();
        assert_eq!(relative, "code/inplace.c");
        assert_eq!(fs::read_to_string(&source).unwrap(), "keep me\n");
    }

    #[test]
    fn missing_source_is_an_error() {
        let bundle = tempdir().unwrap();
        let err = prepare_source_file(bundle.path(), &bundle.path().join("nope.c")).unwrap_err();
        assert!(err.to_string().contains("source file not found"));
    }

    #[test]
    fn script_env_disables_terminal_features() {
        let env = script_env();
        assert_eq!(env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(env.get("BASH_ENV").map(String::as_str), Some(""));
    }
}
