//! The RPM per-node build pipeline.
//!
//! Stage layout under the work root, per node:
//!
//! ```text
//! <name>.<release-uid>.rpm-build/
//!   pkg/      spec file + downloaded sources, then signed rpms
//!   repo/     transient local repo of the dependency closure
//!   output/   captured artifacts
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use repomason_process::run_stdout;

use crate::container::{Mount, builder_image};
use crate::debian::run_step;
use crate::fsutil;
use crate::node::{BuildContext, PackageNode};
use crate::repo;

/// Run the whole pipeline for one node; returns the populated output
/// directory.
pub fn build(node: &PackageNode, ctx: &BuildContext<'_>) -> Result<PathBuf> {
    let release = &node.release;

    let work = ctx
        .work_root
        .join(format!("{}.{}.rpm-build", node.name, release.uid()));
    let output = work.join("output");
    let pkg = work.join("pkg");
    let repo_dir = work.join("repo");
    for dir in [&output, &pkg, &repo_dir] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let spec_name = format!("{}.spec", node.name);
    let spec_src = node.source_dir.join(&spec_name);
    let spec = pkg.join(&spec_name);
    fs::copy(&spec_src, &spec)
        .with_context(|| format!("failed to copy {}", spec_src.display()))?;

    repo::build_local_repo(ctx, node, &repo_dir)?;

    fetch_sources(node, ctx, &spec, &pkg)?;

    let image = builder_image(ctx.registry, &release.distro_id, release.builder_tag());
    ctx.reporter
        .lock()
        .unwrap()
        .info(&format!("{}: building in {image}", node.name));
    // A leaf node has an empty closure; the mount point must still exist.
    let local = repo_dir.join(&release.numeric_id);
    fs::create_dir_all(&local)?;
    let mounts = [Mount::new(&pkg, "/src"), Mount::new(&local, "/localrepo")];
    run_step(ctx, &ctx.runtime.run_argv(&image, &mounts, None, &[]), None)?;

    fs::remove_dir_all(&repo_dir)?;

    sign_rpms(ctx, &pkg)?;

    for rpm in fsutil::files_with_suffix(&pkg, ".rpm")? {
        let target = output.join(rpm.file_name().unwrap());
        fs::rename(&rpm, &target)
            .with_context(|| format!("failed to capture {}", target.display()))?;
    }
    fs::remove_dir_all(&pkg)?;

    Ok(output)
}

/// Resolve the spec's `Source:` entries and place them in `pkg/`.
fn fetch_sources(
    node: &PackageNode,
    ctx: &BuildContext<'_>,
    spec: &Path,
    pkg: &Path,
) -> Result<()> {
    let expanded = run_stdout(
        ctx.token,
        &[
            "rpmspec".to_string(),
            "-P".to_string(),
            spec.display().to_string(),
        ],
        None,
    )
    .with_context(|| format!("failed to expand {}", spec.display()))?;

    for source in spec_sources(&expanded) {
        let filename = source_filename(&source);
        let dest = pkg.join(&filename);
        if source.contains("://") {
            ctx.downloader.fetch(ctx.token, &source, &dest)?;
        } else {
            // Plain filenames (patches, local tarballs) ship with the spec.
            let local = node.source_dir.join(&source);
            fs::copy(&local, &dest)
                .with_context(|| format!("failed to copy source {}", local.display()))?;
        }
    }
    Ok(())
}

/// `SourceN:` values from an expanded spec, in order.
pub(crate) fn spec_sources(expanded: &str) -> Vec<String> {
    expanded
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            let lower = trimmed.to_ascii_lowercase();
            if !lower.starts_with("source") {
                return None;
            }
            let rest = &trimmed[6..];
            let (digits, value) = rest.split_once(':')?;
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let value = value.trim();
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        })
        .collect()
}

/// The local filename of a source URL: the last `name=value` pair of the
/// query string when present, else the basename of the path.
pub(crate) fn source_filename(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    if let Some((_, query)) = without_fragment.split_once('?') {
        if let Some(value) = query
            .split('&')
            .filter_map(|pair| pair.split_once('=').map(|(_, v)| v))
            .last()
        {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    let path = without_fragment.split('?').next().unwrap_or(without_fragment);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Re-sign every produced rpm with the context's key.
fn sign_rpms(ctx: &BuildContext<'_>, pkg: &Path) -> Result<()> {
    for rpm in fsutil::files_with_suffix(pkg, ".rpm")? {
        let argv = vec![
            "rpmsign".to_string(),
            "--define".to_string(),
            ctx.gpg.wrapper_arg("_gpg_bin "),
            "--define".to_string(),
            ctx.gpg.wrapper_arg("__gpg "),
            "--define".to_string(),
            format!("_gpg_home {}", ctx.gpg.home().display()),
            "--define".to_string(),
            ctx.gpg.key_id_arg("_gpg_name "),
            "--resign".to_string(),
            rpm.display().to_string(),
        ];
        run_step(ctx, &argv, None)
            .with_context(|| format!("failed to sign {}", rpm.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_sources_filters_source_lines_case_insensitively() {
        let expanded = "\
Name: libfoo
Version: 1.2
Source0: https://example.org/libfoo-1.2.tar.gz
source1: https://example.org/extra.patch
  Source10:   https://example.org/tenth.tar.xz
SourceXYZ: not-a-source
Patch0: local.patch
";
        assert_eq!(
            spec_sources(expanded),
            vec![
                "https://example.org/libfoo-1.2.tar.gz",
                "https://example.org/extra.patch",
                "https://example.org/tenth.tar.xz",
            ]
        );
    }

    #[test]
    fn bare_source_line_is_included() {
        assert_eq!(
            spec_sources("Source: relative-file.tar.gz\n"),
            vec!["relative-file.tar.gz"]
        );
    }

    #[test]
    fn source_filename_prefers_last_query_pair() {
        assert_eq!(
            source_filename("https://example.org/download?file=libfoo-1.2.tar.gz"),
            "libfoo-1.2.tar.gz"
        );
        assert_eq!(
            source_filename("https://example.org/dl?id=42&name=pkg.tar.xz"),
            "pkg.tar.xz"
        );
    }

    #[test]
    fn source_filename_falls_back_to_basename() {
        assert_eq!(
            source_filename("https://example.org/pool/libfoo-1.2.tar.gz"),
            "libfoo-1.2.tar.gz"
        );
        assert_eq!(source_filename("local.patch"), "local.patch");
    }
}
