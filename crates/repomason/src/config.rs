//! Typed configuration loaded from `build.conf`.
//!
//! The on-disk format is YAML:
//!
//! ```yaml
//! distribs:
//!   pdi:
//!     gpg: { file: signing-key.asc, id: A1B2C3D4 }
//!     versions:
//!       debian: [supported]
//!       fedora: [38, +]
//!     repository:
//!       path: /srv/repos/pdi
//!       url: https://repo.example.org/pdi
//!       name: pdi
//!       description: PDI development packages
//! packages:
//!   libfoo:
//!     orig: https://example.org/libfoo/{package}_{upstream_version}.orig.tar.gz
//!     disable: { debian: [bullseye] }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::release::Release;

/// A release selector as written in YAML. Bare scalars are accepted, so
/// `versions: { fedora: [38, "+"] }` and `debian: [bookworm]` both parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Int(n) => write!(f, "{n}"),
            Selector::Float(x) => write!(f, "{x}"),
            Selector::Text(s) => f.write_str(s),
        }
    }
}

pub const DEFAULT_CONFIG_PATH: &str = "build.conf";

fn default_registry() -> String {
    "ghcr.io/pdidev".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Output distribution configurations, keyed by an arbitrary name.
    pub distribs: BTreeMap<String, DistribConfig>,
    /// Source packages, keyed by directory name under the repo root.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistribConfig {
    pub gpg: GpgConfig,
    /// Release selectors per distribution id, e.g.
    /// `debian: [supported]` or `fedora: [38, "+"]`.
    pub versions: BTreeMap<String, Vec<Selector>>,
    pub repository: RepositoryConfig,
    /// Registry prefix for the builder container images.
    #[serde(default = "default_registry")]
    pub registry: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpgConfig {
    /// Private key file to import.
    pub file: PathBuf,
    /// Key selector: the last 8 hex digits of the fingerprint.
    #[serde(default)]
    pub id: Option<String>,
    /// Uid selector: substring of the key's uid record.
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Where the final repositories are written.
    pub path: PathBuf,
    /// Public base URL; enables keyring export and README rendering.
    #[serde(default)]
    pub url: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageConfig {
    /// URL template for the upstream tarball, with `{package}` and
    /// `{upstream_version}` placeholders.
    #[serde(default)]
    pub orig: Option<String>,
    /// Releases on which this package is not built, as selector literals
    /// per distribution id.
    #[serde(default)]
    pub disable: BTreeMap<String, Vec<Selector>>,
    /// Inner build concurrency (`-j` inside the builder container).
    #[serde(default)]
    pub parallelism: Option<u32>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError(format!("{}: {e}", path.display())))
    }

    pub fn package(&self, name: &str) -> PackageConfig {
        self.packages.get(name).cloned().unwrap_or_default()
    }
}

impl PackageConfig {
    /// True when this package is disabled on `release`.
    pub fn disabled_on(&self, release: &Release) -> bool {
        self.disable
            .get(&release.distro_id)
            .is_some_and(|selectors| {
                selectors.iter().any(|sel| match sel.to_string().as_str() {
                    "all" => true,
                    "supported" => release.supported,
                    literal => release.matches(literal),
                })
            })
    }
}
