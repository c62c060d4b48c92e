use crate::bundle;
use crate::error::DistroLabError;
use clap::ValueEnum;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Distribution {
    #[default]
    Ubuntu,
    UbuntuLatest,
    Debian,
    Fedora,
    Alpine,
    Archlinux,
    Centos,
    OpensuseLeap,
    OpensuseTumbleweed,
    RockyLinux,
    Almalinux,
    Oraclelinux,
    Amazonlinux,
    Gentoo,
    KaliLinux,
}

impl Distribution {
    pub const ALL: [Distribution; 15] = [
        Distribution::Ubuntu,
        Distribution::UbuntuLatest,
        Distribution::Debian,
        Distribution::Fedora,
        Distribution::Alpine,
        Distribution::Archlinux,
        Distribution::Centos,
        Distribution::OpensuseLeap,
        Distribution::OpensuseTumbleweed,
        Distribution::RockyLinux,
        Distribution::Almalinux,
        Distribution::Oraclelinux,
        Distribution::Amazonlinux,
        Distribution::Gentoo,
        Distribution::KaliLinux,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Distribution::Ubuntu => "ubuntu",
            Distribution::UbuntuLatest => "ubuntu-latest",
            Distribution::Debian => "debian",
            Distribution::Fedora => "fedora",
            Distribution::Alpine => "alpine",
            Distribution::Archlinux => "archlinux",
            Distribution::Centos => "centos",
            Distribution::OpensuseLeap => "opensuse-leap",
            Distribution::OpensuseTumbleweed => "opensuse-tumbleweed",
            Distribution::RockyLinux => "rocky-linux",
            Distribution::Almalinux => "almalinux",
            Distribution::Oraclelinux => "oraclelinux",
            Distribution::Amazonlinux => "amazonlinux",
            Distribution::Gentoo => "gentoo",
            Distribution::KaliLinux => "kali-linux",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub default_distro: Distribution,
    pub auto_setup: bool,
    pub paths: Paths,
    pub docker: Docker,
    pub scripts: Scripts,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub bundle_dir: String,
    pub log_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Docker {
    pub compose_file: String,
    pub container_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Scripts {
    pub dir: String,
    pub compile_run: String,
    pub run_all: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            default_distro: Distribution::default(),
            auto_setup: true,
            paths: Paths::default(),
            docker: Docker::default(),
            scripts: Scripts::default(),
        }
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self {
            compose_file: "docker-compose.yml".to_string(),
            container_prefix: "linux-book".to_string(),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            dir: "scripts".to_string(),
            compile_run: "compile-and-run.sh".to_string(),
            run_all: "run-all-distros.sh".to_string(),
        }
    }
}

impl Config {
    pub fn log_file(&self) -> Option<PathBuf> {
        let raw = self.paths.log_file.trim();
        if raw.is_empty() {
            None
        } else {
            Some(PathBuf::from(expand_path(raw)))
        }
    }

    pub fn compose_file(&self, bundle_dir: &Path) -> PathBuf {
        bundle_dir.join(expand_path(self.docker.compose_file.trim()))
    }

    pub fn script_path(&self, bundle_dir: &Path, script: &str) -> PathBuf {
        bundle_dir.join(expand_path(self.scripts.dir.trim())).join(script)
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    pub config_path: PathBuf,
    pub bundle_dir_override: Option<PathBuf>,
    pub json: bool,
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("DISTROLAB_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("DISTROLAB_CONFIG_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("distrolab");
    base
}

pub fn ensure_parent(path: &Path) -> Result<(), DistroLabError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn read_config_from_str(content: &str) -> Result<Config, DistroLabError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, DistroLabError> {
    let content = fs::read_to_string(path).map_err(|err| {
        DistroLabError::Config(format!(
            "failed to read config at {}: {err}; run `distrolab config init` to create it",
            path.display()
        ))
    })?;
    read_config_from_str(&content)
}

/// Like [`read_config`], but a missing file means built-in defaults.
pub fn load_config(path: &Path) -> Result<Config, DistroLabError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path)
}

fn validate_config(cfg: &Config) -> Result<(), DistroLabError> {
    if cfg.version != 1 {
        return Err(DistroLabError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    let required = [
        ("docker.compose_file", &cfg.docker.compose_file),
        ("docker.container_prefix", &cfg.docker.container_prefix),
        ("scripts.dir", &cfg.scripts.dir),
        ("scripts.compile_run", &cfg.scripts.compile_run),
        ("scripts.run_all", &cfg.scripts.run_all),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(DistroLabError::Config(format!("{field} must not be empty")));
        }
    }
    Ok(())
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), DistroLabError> {
    let content = serde_yaml::to_string(cfg)?;
    write_atomic_text_file(path, &content)
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), DistroLabError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "distrolab".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Where the bundled scripts live: flag, env, config, then auto-detection.
pub fn resolve_bundle_dir(ctx: &Context, cfg: &Config) -> PathBuf {
    if let Some(path) = &ctx.bundle_dir_override {
        return path.clone();
    }
    if let Ok(path) = env::var("DISTROLAB_BUNDLE_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(expand_path(path.trim()));
        }
    }
    let configured = cfg.paths.bundle_dir.trim();
    if !configured.is_empty() {
        return PathBuf::from(expand_path(configured));
    }
    let exe = env::current_exe().ok();
    let cwd = env::current_dir().ok();
    bundle::detect_bundle_dir(exe.as_deref(), cwd.as_deref())
        .or(cwd)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.default_distro, Distribution::Ubuntu);
        assert!(cfg.auto_setup);
        assert_eq!(cfg.docker.compose_file, "docker-compose.yml");
        assert_eq!(cfg.docker.container_prefix, "linux-book");
        assert_eq!(cfg.scripts.compile_run, "compile-and-run.sh");
        assert!(cfg.log_file().is_none());
    }

    #[test]
    fn default_template_parses() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("template");
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.scripts.run_all, "run-all-distros.sh");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = read_config_from_str("version: 2").expect_err("version 2");
        assert!(err.to_string().contains("unsupported config version 2"));
    }

    #[test]
    fn empty_script_name_is_rejected() {
        let err = read_config_from_str("version: 1\nscripts:\n  compile_run: \"\"\n")
            .expect_err("empty script");
        assert!(err.to_string().contains("scripts.compile_run"));
    }

    #[test]
    fn unknown_distribution_is_rejected() {
        assert!(read_config_from_str("version: 1\ndefault_distro: plan9\n").is_err());
        let cfg = read_config_from_str("version: 1\ndefault_distro: rocky-linux\n").unwrap();
        assert_eq!(cfg.default_distro, Distribution::RockyLinux);
    }

    #[test]
    fn distribution_names_round_trip_through_clap() {
        for distro in Distribution::ALL {
            let parsed = Distribution::from_str(distro.as_str(), false).expect("known name");
            assert_eq!(parsed, distro);
            let yaml = serde_yaml::to_string(&distro).unwrap();
            assert_eq!(yaml.trim(), distro.as_str());
        }
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/distrolab.log");
        assert!(!expanded.starts_with("~/"));
    }

    #[test]
    fn load_config_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg.version, 1);
        assert!(read_config(&dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn write_config_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut cfg = Config::default();
        cfg.default_distro = Distribution::Alpine;
        write_config(&path, &cfg).unwrap();
        let loaded = read_config(&path).unwrap();
        assert_eq!(loaded.default_distro, Distribution::Alpine);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn bundle_dir_override_wins() {
        let dir = tempdir().unwrap();
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            bundle_dir_override: Some(dir.path().join("bundle")),
            json: false,
        };
        let mut cfg = Config::default();
        cfg.paths.bundle_dir = "/elsewhere".to_string();
        assert_eq!(resolve_bundle_dir(&ctx, &cfg), dir.path().join("bundle"));
    }

    #[test]
    fn script_and_compose_paths_join_bundle() {
        let cfg = Config::default();
        let bundle = Path::new("/opt/distrolab/bundled");
        assert_eq!(
            cfg.script_path(bundle, &cfg.scripts.compile_run),
            PathBuf::from("/opt/distrolab/bundled/scripts/compile-and-run.sh")
        );
        assert_eq!(
            cfg.compose_file(bundle),
            PathBuf::from("/opt/distrolab/bundled/docker-compose.yml")
        );
    }
}
