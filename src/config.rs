//! Configuration for sbs2.
//!
//! Configuration sources (highest priority first):
//! 1. `SBS2_CONFIG` naming a config file, `SBS2_HOME` overriding the home dir
//! 2. Config file (.sbs2/config.yaml in the current directory or a parent)
//! 3. Defaults (~/.sbs2, one filesystem library named `FSLibrary`)
//!
//! Relative paths in a config file resolve against the directory that
//! holds `.sbs2/`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::intake::IntakeSettings;
use crate::library::aws::DEFAULT_ENTRY_TTL_DAYS;

pub const CONFIG_ENV: &str = "SBS2_CONFIG";
pub const HOME_ENV: &str = "SBS2_HOME";
pub const DEFAULT_LIBRARY_NAME: &str = "FSLibrary";
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    /// State directory (relative to the project root)
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub libraries: Vec<LibraryEntry>,
    #[serde(default)]
    pub intake: IntakeSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    Filesystem,
    Sqlite,
    Aws,
}

/// One `libraries:` item as written in the file
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryEntry {
    pub name: String,
    pub kind: LibraryKind,
    /// filesystem/sqlite root; defaults to `<home>/libraries/<name>`
    pub root: Option<String>,
    pub bucket: Option<String>,
    pub table: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub entry_ttl_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Backend parameters with paths resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LibraryBackend {
    Filesystem {
        root: PathBuf,
    },
    Sqlite {
        root: PathBuf,
    },
    Aws {
        bucket: String,
        table: String,
        region: Option<String>,
        endpoint_url: Option<String>,
        entry_ttl_days: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryConfig {
    pub name: String,
    #[serde(flatten)]
    pub backend: LibraryBackend,
}

impl LibraryConfig {
    pub fn filesystem(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            backend: LibraryBackend::Filesystem { root: root.into() },
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to sbs2 home
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub libraries: Vec<LibraryConfig>,
    pub intake: IntakeSettings,
    pub server: ServerSettings,
}

/// Find config file: `$SBS2_CONFIG`, then current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".sbs2").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Directory that relative paths resolve against: the parent of `.sbs2/`,
/// or the file's own directory for a config kept elsewhere
fn base_dir(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new("."));
    if parent.file_name().map_or(false, |n| n == ".sbs2") {
        parent.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

fn resolve_library(entry: LibraryEntry, base: &Path, home: &Path) -> Result<LibraryConfig> {
    let local_root = |entry: &LibraryEntry| match &entry.root {
        Some(root) => resolve_path(base, root),
        None => home.join("libraries").join(&entry.name),
    };

    let backend = match entry.kind {
        LibraryKind::Filesystem => LibraryBackend::Filesystem {
            root: local_root(&entry),
        },
        LibraryKind::Sqlite => LibraryBackend::Sqlite {
            root: local_root(&entry),
        },
        LibraryKind::Aws => LibraryBackend::Aws {
            bucket: entry
                .bucket
                .clone()
                .with_context(|| format!("Library '{}' needs a bucket", entry.name))?,
            table: entry
                .table
                .clone()
                .with_context(|| format!("Library '{}' needs a table", entry.name))?,
            region: entry.region.clone(),
            endpoint_url: entry.endpoint_url.clone(),
            entry_ttl_days: entry.entry_ttl_days.unwrap_or(DEFAULT_ENTRY_TTL_DAYS),
        },
    };

    Ok(LibraryConfig {
        name: entry.name,
        backend,
    })
}

/// Build the resolved config from an optional file and the fallback home
fn resolve(
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    home_override: Option<PathBuf>,
) -> Result<ResolvedConfig> {
    let file = match &config_file {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };
    let base = config_file.as_deref().map(base_dir);

    let home = match (home_override, &file, &base) {
        (Some(home), _, _) => home,
        (None, Some(ConfigFile { home: Some(home), .. }), Some(base)) => resolve_path(base, home),
        _ => default_home,
    };

    let (libraries, intake, server) = match file {
        Some(file) => {
            let base = base.unwrap_or_else(|| PathBuf::from("."));
            let libraries = file
                .libraries
                .into_iter()
                .map(|entry| resolve_library(entry, &base, &home))
                .collect::<Result<Vec<_>>>()?;
            (libraries, file.intake, file.server)
        }
        None => (Vec::new(), IntakeSettings::default(), ServerSettings::default()),
    };

    let libraries = if libraries.is_empty() {
        vec![LibraryConfig::filesystem(
            DEFAULT_LIBRARY_NAME,
            home.join("libraries").join(DEFAULT_LIBRARY_NAME),
        )]
    } else {
        libraries
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        libraries,
        intake,
        server,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".sbs2");
    let home_override = std::env::var(HOME_ENV).ok().map(PathBuf::from);

    resolve(find_config_file(), default_home, home_override)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let sbs2_dir = dir.join(".sbs2");
        std::fs::create_dir_all(&sbs2_dir).unwrap();
        let config_path = sbs2_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, PathBuf::from("/home/u/.sbs2"), None).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/u/.sbs2"));
        assert!(config.config_file.is_none());
        assert_eq!(
            config.libraries,
            vec![LibraryConfig::filesystem(
                "FSLibrary",
                "/home/u/.sbs2/libraries/FSLibrary"
            )]
        );
        assert_eq!(config.intake, IntakeSettings::default());
        assert_eq!(config.server.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
home: state
libraries:
  - name: Photos
    kind: filesystem
    root: ./photos
  - name: Index
    kind: sqlite
  - name: Cloud
    kind: aws
    bucket: media
    table: entries
    region: us-east-1
intake:
  max_concurrent_downloads: 4
  retry_policy:
    max_attempts: 5
server:
  bind: 0.0.0.0:9000
"#,
        );

        let config = resolve(Some(config_path), PathBuf::from("/unused"), None).unwrap();
        let home = temp.path().join("state");

        assert_eq!(config.home, home);
        assert_eq!(config.libraries.len(), 3);
        assert_eq!(
            config.libraries[1].backend,
            LibraryBackend::Sqlite {
                root: home.join("libraries").join("Index")
            }
        );
        assert_eq!(
            config.libraries[2].backend,
            LibraryBackend::Aws {
                bucket: "media".to_string(),
                table: "entries".to_string(),
                region: Some("us-east-1".to_string()),
                endpoint_url: None,
                entry_ttl_days: DEFAULT_ENTRY_TTL_DAYS,
            }
        );
        assert_eq!(config.intake.max_concurrent_downloads, 4);
        assert_eq!(config.intake.retry_policy.max_attempts, 5);
        assert_eq!(config.intake.status_capacity, 100);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_aws_library_requires_bucket() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
libraries:
  - name: Cloud
    kind: aws
    table: entries
"#,
        );

        let err = resolve(Some(config_path), PathBuf::from("/h"), None).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn test_home_override_wins() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "version: \"1.0\"\nhome: state");

        let config = resolve(
            Some(config_path),
            PathBuf::from("/h"),
            Some(PathBuf::from("/override")),
        )
        .unwrap();
        assert_eq!(config.home, PathBuf::from("/override"));
        assert_eq!(
            config.libraries[0].backend,
            LibraryBackend::Filesystem {
                root: PathBuf::from("/override/libraries/FSLibrary")
            }
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_base_dir_outside_project() {
        assert_eq!(
            base_dir(Path::new("/p/.sbs2/config.yaml")),
            PathBuf::from("/p")
        );
        assert_eq!(
            base_dir(Path::new("/etc/sbs2.yaml")),
            PathBuf::from("/etc")
        );
    }
}
