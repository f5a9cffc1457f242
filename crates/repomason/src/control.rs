//! Parsing of Debian packaging metadata: `debian/control` stanzas and
//! `debian/changelog` entries, plus the automated changelog bump applied
//! before every rebuild.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};

use crate::errors::ConfigError;
use crate::release::Release;

/// The fields of `debian/control` the build graph cares about.
#[derive(Debug, Clone, Default)]
pub struct ControlFile {
    /// Source package name, from the first stanza.
    pub source: Option<String>,
    /// `Package:` fields across all binary stanzas.
    pub binaries: Vec<String>,
    /// Bare package names referenced from `Build-Depends`,
    /// `Build-Depends-Indep`, and `Build-Depends-Arch`. Alternatives
    /// contribute all alternates.
    pub build_depends: Vec<String>,
}

/// Parse a `debian/control` file.
pub fn parse_control(text: &str) -> ControlFile {
    let mut control = ControlFile::default();

    for stanza in stanzas(text) {
        for (name, value) in &stanza {
            match name.to_ascii_lowercase().as_str() {
                "source" => {
                    if control.source.is_none() {
                        control.source = Some(value.trim().to_string());
                    }
                }
                "package" => control.binaries.push(value.trim().to_string()),
                "build-depends" | "build-depends-indep" | "build-depends-arch" => {
                    for name in depends_names(value) {
                        if !control.build_depends.contains(&name) {
                            control.build_depends.push(name);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    control
}

/// Split an RFC-822-style file into stanzas of (field, value) pairs.
/// Continuation lines are folded into the preceding field; `#` comment
/// lines are dropped.
fn stanzas(text: &str) -> Vec<Vec<(String, String)>> {
    let mut out: Vec<Vec<(String, String)>> = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.last_mut() {
                value.push('\n');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            current.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }

    out
}

/// Extract the bare package names from a dependency field value, dropping
/// version restrictions, architecture qualifiers, and build profiles.
/// `libfoo-dev (>= 1.2) [amd64] | libbar-dev <!nocheck>` yields both names.
pub fn depends_names(value: &str) -> Vec<String> {
    let mut names = Vec::new();
    for relation in value.split(',') {
        for alternative in relation.split('|') {
            if let Some(name) = dep_name(alternative) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

fn dep_name(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() || token.starts_with('$') {
        // Substvars are resolved at package build time, not ours.
        return None;
    }
    let end = token
        .find(|c: char| c.is_whitespace() || matches!(c, '(' | '[' | '<'))
        .unwrap_or(token.len());
    let name = &token[..end];
    // Strip an architecture qualifier such as `libfoo:any`.
    let name = name.split(':').next().unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// The topmost entry of a `debian/changelog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogEntry {
    pub package: String,
    pub version: String,
    pub distribution: String,
    pub urgency: String,
    pub date: DateTime<FixedOffset>,
}

/// Parse the topmost changelog entry: the header line
/// `package (version) distribution; urgency=...` and the trailer date.
pub fn parse_top_entry(text: &str) -> Result<ChangelogEntry> {
    let mut lines = text.lines();
    let header = lines
        .by_ref()
        .find(|l| !l.trim().is_empty())
        .context("changelog is empty")?;

    let (package, rest) = header
        .split_once(' ')
        .with_context(|| format!("malformed changelog header: {header}"))?;
    let open = rest.find('(').context("changelog header misses version")?;
    let close = rest.find(')').context("changelog header misses version")?;
    let version = rest[open + 1..close].to_string();
    let after = &rest[close + 1..];
    let (dists, opts) = after
        .split_once(';')
        .with_context(|| format!("malformed changelog header: {header}"))?;
    let distribution = dists.trim().to_string();
    let urgency = opts
        .split(';')
        .flat_map(|o| o.split(','))
        .find_map(|o| o.trim().strip_prefix("urgency="))
        .unwrap_or("medium")
        .split_whitespace()
        .next()
        .unwrap_or("medium")
        .to_string();

    let trailer = lines
        .find(|l| l.starts_with(" -- "))
        .context("changelog entry misses a trailer line")?;
    let date_start = trailer
        .rfind('>')
        .context("changelog trailer misses the author address")?;
    let date = DateTime::parse_from_rfc2822(trailer[date_start + 1..].trim())
        .with_context(|| format!("malformed changelog date: {trailer}"))?;

    Ok(ChangelogEntry {
        package: package.to_string(),
        version,
        distribution,
        urgency,
        date,
    })
}

/// The upstream part of a Debian version: epoch and revision stripped.
pub fn upstream_version(version: &str) -> &str {
    let version = match version.split_once(':') {
        Some((_, rest)) => rest,
        None => version,
    };
    match version.rsplit_once('-') {
        Some((upstream, _)) => upstream,
        None => version,
    }
}

/// Result of [`bump_changelog`].
#[derive(Debug, Clone)]
pub struct ChangelogBump {
    /// The whole changelog with the new entry prepended.
    pub text: String,
    /// The new (suffixed) version.
    pub version: String,
    /// The version the suffix was derived from.
    pub base_version: String,
}

/// Prepend a rebuild entry for `release`, suffixing the topmost version
/// with `~bpo<numeric-id>.pdidev.<seconds>` where `<seconds>` counts from
/// the topmost entry's date to `now`.
pub fn bump_changelog(
    original: &str,
    release: &Release,
    author: &str,
    now: DateTime<Utc>,
) -> Result<ChangelogBump> {
    let top = parse_top_entry(original)?;
    let codename = release.codename.as_deref().ok_or_else(|| {
        ConfigError(format!("release {release} has no codename to target"))
    })?;

    let elapsed = (now.timestamp() - top.date.timestamp()).max(0);
    let version = format!(
        "{}~bpo{}.pdidev.{}",
        top.version, release.numeric_id, elapsed
    );

    let text = format!(
        "{} ({}) {}; urgency={}\n\n  * Rebuild for {}\n\n -- {}  {}\n\n{}",
        top.package,
        version,
        codename,
        top.urgency,
        release,
        author,
        now.to_rfc2822(),
        original
    );

    Ok(ChangelogBump {
        text,
        version,
        base_version: top.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::releases_of;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const CONTROL: &str = "\
Source: libfoo
Maintainer: Jane Doe <jane@example.org>
Build-Depends: debhelper-compat (= 13),
 cmake (>= 3.16),
 libbar-dev (>= 1.2) [amd64] | libbar-legacy-dev,
 python3:any,
 ${misc:Depends}
Build-Depends-Indep: doxygen <!nodoc>

# binary stanzas follow
Package: libfoo1
Architecture: any
Description: foo runtime

Package: libfoo-dev
Architecture: any
Description: foo headers
";

    const CHANGELOG: &str = "\
libfoo (1.4.2-1) unstable; urgency=medium

  * New upstream release.

 -- Jane Doe <jane@example.org>  Sat, 04 Mar 2023 10:00:00 +0100

libfoo (1.4.1-1) unstable; urgency=low

  * Initial release.

 -- Jane Doe <jane@example.org>  Wed, 01 Feb 2023 09:30:00 +0100
";

    fn bookworm() -> Release {
        releases_of("debian")
            .into_iter()
            .find(|r| r.numeric_id == "12")
            .unwrap()
    }

    #[test]
    fn control_collects_binaries_and_build_depends() {
        let control = parse_control(CONTROL);
        assert_eq!(control.source.as_deref(), Some("libfoo"));
        assert_eq!(control.binaries, vec!["libfoo1", "libfoo-dev"]);
        assert_eq!(
            control.build_depends,
            vec![
                "debhelper-compat",
                "cmake",
                "libbar-dev",
                "libbar-legacy-dev",
                "python3",
                "doxygen",
            ]
        );
    }

    #[test]
    fn depends_names_handles_alternatives_and_qualifiers() {
        assert_eq!(
            depends_names("a (>= 1) | b [i386], c:native, ${shlibs:Depends}"),
            vec!["a", "b", "c"]
        );
        assert!(depends_names("").is_empty());
    }

    #[test]
    fn top_entry_is_parsed() {
        let entry = parse_top_entry(CHANGELOG).expect("parse");
        assert_eq!(entry.package, "libfoo");
        assert_eq!(entry.version, "1.4.2-1");
        assert_eq!(entry.distribution, "unstable");
        assert_eq!(entry.urgency, "medium");
        assert_eq!(entry.date.timestamp(), 1677920400);
    }

    #[test]
    fn upstream_version_strips_epoch_and_revision() {
        assert_eq!(upstream_version("1.4.2-1"), "1.4.2");
        assert_eq!(upstream_version("2:1.4.2-1ubuntu3"), "1.4.2");
        assert_eq!(upstream_version("1.4.2"), "1.4.2");
        assert_eq!(upstream_version("1.2-rc1-3"), "1.2-rc1");
    }

    #[test]
    fn bump_prepends_entry_with_elapsed_suffix() {
        let now = Utc.with_ymd_and_hms(2023, 3, 4, 9, 0, 10).unwrap();
        // Top entry is 10:00:00 +0100 == 09:00:00 UTC; ten seconds later.
        let bump = bump_changelog(CHANGELOG, &bookworm(), "Builder <b@example.org>", now)
            .expect("bump");
        assert_eq!(bump.version, "1.4.2-1~bpo12.pdidev.10");
        assert_eq!(bump.base_version, "1.4.2-1");

        let top = parse_top_entry(&bump.text).expect("reparse");
        assert_eq!(top.version, bump.version);
        assert_eq!(top.distribution, "bookworm");
        assert_eq!(top.urgency, "medium");

        // The second entry is the unmodified original.
        assert!(bump.text.contains("libfoo (1.4.2-1) unstable; urgency=medium"));
        assert!(bump.text.contains("Rebuild for debian bookworm"));
    }

    #[test]
    fn bump_clamps_negative_elapsed_to_zero() {
        let before = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let bump = bump_changelog(CHANGELOG, &bookworm(), "B <b@e>", before).expect("bump");
        assert!(bump.version.ends_with(".pdidev.0"));
    }

    #[test]
    fn bump_requires_a_codename() {
        let fedora = releases_of("fedora").pop().unwrap();
        let now = Utc.with_ymd_and_hms(2023, 3, 4, 12, 0, 0).unwrap();
        assert!(bump_changelog(CHANGELOG, &fedora, "B <b@e>", now).is_err());
    }

    proptest! {
        #[test]
        fn bumped_version_matches_suffix_shape(seconds in 0i64..100_000_000) {
            let top = parse_top_entry(CHANGELOG).unwrap();
            let now = Utc
                .timestamp_opt(top.date.timestamp() + seconds, 0)
                .unwrap();
            let bump = bump_changelog(CHANGELOG, &bookworm(), "B <b@e>", now).unwrap();
            let suffix = bump.version.strip_prefix(&format!("{}~bpo12.pdidev.", top.version));
            prop_assert!(suffix.is_some());
            let n: i64 = suffix.unwrap().parse().unwrap();
            prop_assert_eq!(n, seconds);
        }
    }
}
