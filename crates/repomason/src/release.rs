//! Distribution releases: the built-in catalog, configuration selectors,
//! and the `-D` command-line filters.
//!
//! A release can be named three ways (codename, suite, numeric id) and the
//! selectors accept all three, plus the `supported` / `all` windows and the
//! `+` / `-` extenders which widen the immediately-preceding selection by
//! one release.

use std::cmp::Ordering;
use std::fmt;

use crate::errors::ConfigError;

/// Distribution family, derived from the platform's `ID_LIKE` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Debian,
    Fedora,
}

impl Family {
    pub fn is_debian_like(self) -> bool {
        matches!(self, Family::Debian)
    }

    pub fn is_fedora_like(self) -> bool {
        matches!(self, Family::Fedora)
    }
}

/// One (distribution, version) pair. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub distro_id: String,
    pub family: Family,
    /// Version number as published by the distribution (`12`, `22.04`, `38`).
    pub numeric_id: String,
    pub codename: Option<String>,
    pub suite: Option<String>,
    pub supported: bool,
}

impl Release {
    /// Filesystem-safe unique name, e.g. `debian-bookworm`, `fedora-38`.
    pub fn uid(&self) -> String {
        format!(
            "{}-{}",
            self.distro_id,
            self.codename.as_deref().unwrap_or(&self.numeric_id)
        )
    }

    /// The tag of this release's builder container image: codename for
    /// Debian-like releases, numeric id for Fedora-like ones.
    pub fn builder_tag(&self) -> &str {
        match self.family {
            Family::Debian => self.codename.as_deref().unwrap_or(&self.numeric_id),
            Family::Fedora => &self.numeric_id,
        }
    }

    /// True when `token` names this release by codename, suite, or numeric id.
    pub fn matches(&self, token: &str) -> bool {
        self.codename.as_deref() == Some(token)
            || self.suite.as_deref() == Some(token)
            || self.numeric_id == token
    }

    fn numeric_key(&self) -> Vec<u32> {
        self.numeric_id
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.distro_id,
            self.codename.as_deref().unwrap_or(&self.numeric_id)
        )
    }
}

impl PartialOrd for Release {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Release {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distro_id
            .cmp(&other.distro_id)
            .then_with(|| self.numeric_key().cmp(&other.numeric_key()))
    }
}

fn entry(
    distro_id: &str,
    family: Family,
    numeric_id: &str,
    codename: Option<&str>,
    suite: Option<&str>,
    supported: bool,
) -> Release {
    Release {
        distro_id: distro_id.to_string(),
        family,
        numeric_id: numeric_id.to_string(),
        codename: codename.map(str::to_string),
        suite: suite.map(str::to_string),
        supported,
    }
}

/// The known releases, oldest first within each distribution.
///
/// Suites track the Debian archive at the time of writing; they shift with
/// each stable release, which only affects which literal selectors match.
pub fn catalog() -> Vec<Release> {
    use Family::{Debian, Fedora};
    vec![
        entry("debian", Debian, "10", Some("buster"), None, false),
        entry("debian", Debian, "11", Some("bullseye"), Some("oldstable"), true),
        entry("debian", Debian, "12", Some("bookworm"), Some("stable"), true),
        entry("debian", Debian, "13", Some("trixie"), Some("testing"), true),
        entry("ubuntu", Debian, "18.04", Some("bionic"), None, false),
        entry("ubuntu", Debian, "20.04", Some("focal"), None, true),
        entry("ubuntu", Debian, "22.04", Some("jammy"), None, true),
        entry("ubuntu", Debian, "24.04", Some("noble"), None, true),
        entry("fedora", Fedora, "37", None, None, false),
        entry("fedora", Fedora, "38", None, None, true),
        entry("fedora", Fedora, "39", None, None, true),
        entry("fedora", Fedora, "40", None, None, true),
        entry("centos", Fedora, "8", None, Some("stream8"), false),
        entry("centos", Fedora, "9", None, Some("stream9"), true),
    ]
}

/// All catalog releases of one distribution, ascending.
pub fn releases_of(distro_id: &str) -> Vec<Release> {
    let mut out: Vec<Release> = catalog()
        .into_iter()
        .filter(|r| r.distro_id == distro_id)
        .collect();
    out.sort();
    out
}

/// Resolve a configured selector list against the catalog.
///
/// Selectors are processed in order; each contributes releases to the
/// cumulative selection. `+` and `-` extend the immediately-preceding
/// selector's result by one release forward/backward.
pub fn resolve_selectors(
    distro_id: &str,
    selectors: &[String],
) -> Result<Vec<Release>, ConfigError> {
    let all = releases_of(distro_id);
    if all.is_empty() {
        return Err(ConfigError(format!("unknown distribution: {distro_id}")));
    }

    let mut selected: Vec<Release> = Vec::new();
    let mut previous: Vec<Release> = Vec::new();

    for selector in selectors {
        let result: Vec<Release> = match selector.as_str() {
            "all" => all.clone(),
            "supported" => all.iter().filter(|r| r.supported).cloned().collect(),
            "+" => extend_window(&all, &previous, distro_id, selector, 1)?,
            "-" => extend_window(&all, &previous, distro_id, selector, -1)?,
            literal => {
                let found = all.iter().find(|r| r.matches(literal)).ok_or_else(|| {
                    ConfigError(format!("unknown release selector for {distro_id}: {literal}"))
                })?;
                vec![found.clone()]
            }
        };

        for release in &result {
            if !selected.contains(release) {
                selected.push(release.clone());
            }
        }
        previous = result;
    }

    selected.sort();
    Ok(selected)
}

fn extend_window(
    all: &[Release],
    previous: &[Release],
    distro_id: &str,
    selector: &str,
    direction: i32,
) -> Result<Vec<Release>, ConfigError> {
    if previous.is_empty() {
        return Err(ConfigError(format!(
            "selector `{selector}` for {distro_id} must follow a non-empty selection"
        )));
    }
    let mut window = previous.to_vec();
    let next = if direction > 0 {
        let newest = previous.iter().max().unwrap();
        all.iter().find(|r| *r > newest)
    } else {
        let oldest = previous.iter().min().unwrap();
        all.iter().rev().find(|r| *r < oldest)
    };
    if let Some(release) = next {
        window.push(release.clone());
    }
    window.sort();
    Ok(window)
}

/// One `-D` command-line filter.
///
/// Accepted shapes: `distrib`, `distrib:codename`, `distrib:suite`,
/// `distrib:numeric-id`, `distrib:distro-name`. The first component names
/// an entry under `distribs:` in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistFilter {
    pub distrib: String,
    pub release: Option<String>,
}

impl DistFilter {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (distrib, release) = match raw.split_once(':') {
            Some((d, r)) => (d, Some(r)),
            None => (raw, None),
        };
        if distrib.is_empty() || release == Some("") {
            return Err(ConfigError(format!("malformed distribution filter: {raw}")));
        }
        Ok(Self {
            distrib: distrib.to_string(),
            release: release.map(str::to_string),
        })
    }

    pub fn matches_distrib(&self, name: &str) -> bool {
        self.distrib == name
    }

    pub fn matches_release(&self, name: &str, release: &Release) -> bool {
        if self.distrib != name {
            return false;
        }
        match &self.release {
            None => true,
            Some(token) => release.matches(token) || release.distro_id == *token,
        }
    }
}

/// True when the filter set admits `release` of distrib `name`. An empty
/// filter set admits everything.
pub fn release_selected(filters: &[DistFilter], name: &str, release: &Release) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches_release(name, release))
}

/// True when the filter set admits any release of distrib `name`.
pub fn distrib_selected(filters: &[DistFilter], name: &str) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches_distrib(name))
}
