//! The Debian per-node build pipeline.
//!
//! Stage layout under the work root, per node:
//!
//! ```text
//! <name>.<release-uid>.deb-build/
//!   pkg/      unpacked source (+ orig tarball), then signed artifacts
//!   deps/     mk-build-deps output
//!   repo/     transient local repo of the dependency closure
//!   output/   captured artifacts
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use repomason_process::{run, run_quiet, run_stdout};

use crate::container::{Mount, builder_image};
use crate::control;
use crate::errors::ConfigError;
use crate::fsutil;
use crate::node::{BuildContext, PackageNode};
use crate::repo;

/// Debian source format, from `dpkg-source --print-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    Quilt,
    Native,
}

fn parse_source_format(output: &str) -> Result<SourceFormat, ConfigError> {
    let first = output.lines().next().unwrap_or("").trim();
    match first {
        "3.0 (quilt)" => Ok(SourceFormat::Quilt),
        "3.0 (native)" => Ok(SourceFormat::Native),
        other => Err(ConfigError(format!(
            "unsupported debian source format: {other}"
        ))),
    }
}

/// Run the whole pipeline for one node; returns the populated output
/// directory.
pub fn build(node: &PackageNode, ctx: &BuildContext<'_>) -> Result<PathBuf> {
    let release = &node.release;
    let codename = release
        .codename
        .as_deref()
        .ok_or_else(|| ConfigError(format!("release {release} has no codename")))?;

    let work = ctx
        .work_root
        .join(format!("{}.{}.deb-build", node.name, release.uid()));
    let output = work.join("output");
    let pkg = work.join("pkg");
    let deps = work.join("deps");
    let repo_dir = work.join("repo");
    for dir in [&output, &pkg, &deps, &repo_dir] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let format_out = run_stdout(
        ctx.token,
        &[
            "dpkg-source".to_string(),
            "--print-format".to_string(),
            node.source_dir.display().to_string(),
        ],
        None,
    )?;
    let format = parse_source_format(&format_out)?;

    let changelog_path = node.source_dir.join("debian/changelog");
    let changelog = fs::read_to_string(&changelog_path)
        .with_context(|| format!("failed to read {}", changelog_path.display()))?;
    let bump = control::bump_changelog(&changelog, release, ctx.gpg.uid(), Utc::now())?;
    let upstream = control::upstream_version(&bump.base_version).to_string();

    let source_root = pkg.join(format!("{}-{}", node.name, upstream));
    match format {
        SourceFormat::Quilt => {
            fsutil::copy_tree(&node.source_dir.join("debian"), &source_root.join("debian"))?;
            fetch_orig(node, ctx, &pkg, &upstream)?;
        }
        SourceFormat::Native => {
            fsutil::copy_tree(&node.source_dir, &source_root)?;
        }
    }
    fs::write(source_root.join("debian/changelog"), &bump.text)?;

    // Turn the build dependencies into an installable .deb the container
    // resolves against the local repo.
    run_step(
        ctx,
        &[
            "mk-build-deps".to_string(),
            format!("-P{},{}", release.distro_id, codename),
            source_root.join("debian/control").display().to_string(),
        ],
        Some(&deps),
    )?;

    repo::build_local_repo(ctx, node, &repo_dir)?;

    let image = builder_image(ctx.registry, &release.distro_id, release.builder_tag());
    ctx.reporter
        .lock()
        .unwrap()
        .info(&format!("{}: building in {image}", node.name));
    let mounts = [
        Mount::new(&pkg, "/src"),
        Mount::new(&deps, "/deps"),
        Mount::new(&repo_dir, "/localrepo"),
    ];
    let inner = vec![
        format!("-j{}", node.parallelism),
        "-sa".to_string(),
        format!("-P{},{}", release.distro_id, codename),
    ];
    run_step(ctx, &ctx.runtime.run_argv(&image, &mounts, None, &inner), None)?;

    fs::remove_dir_all(&deps)?;
    fs::remove_dir_all(&repo_dir)?;

    sign_changes(ctx, &pkg)?;

    fsutil::move_files(&pkg, &output)?;
    fs::remove_dir_all(&pkg)?;

    Ok(output)
}

/// Download the orig tarball next to the source tree, naming it by its
/// actual content rather than the URL extension.
fn fetch_orig(node: &PackageNode, ctx: &BuildContext<'_>, pkg: &Path, upstream: &str) -> Result<()> {
    let template = node.orig_url.as_deref().ok_or_else(|| {
        ConfigError(format!(
            "{} is 3.0 (quilt) but has no orig url configured",
            node.name
        ))
    })?;
    let url = template
        .replace("{package}", &node.name)
        .replace("{upstream_version}", upstream);
    ctx.reporter
        .lock()
        .unwrap()
        .info(&format!("{}: fetching orig tarball from {url}", node.name));

    let staging = pkg.join(format!("{}_{}.orig.download", node.name, upstream));
    ctx.downloader.fetch(ctx.token, &url, &staging)?;

    let ext = sniff_tar_extension(&staging)?.ok_or_else(|| {
        ConfigError(format!("{url} is not a recognized compressed tarball"))
    })?;
    let target = pkg.join(format!("{}_{}.orig.tar.{}", node.name, upstream, ext));
    fs::rename(&staging, &target)
        .with_context(|| format!("failed to place {}", target.display()))?;
    Ok(())
}

/// Infer the compression from the file's magic bytes.
fn sniff_tar_extension(path: &Path) -> Result<Option<&'static str>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(sniff_magic(&bytes))
}

fn sniff_magic(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        Some("gz")
    } else if bytes.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some("xz")
    } else if bytes.starts_with(b"BZh") {
        Some("bz2")
    } else if bytes.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Some("zst")
    } else {
        None
    }
}

/// Sign every `.changes` produced by the container build.
fn sign_changes(ctx: &BuildContext<'_>, pkg: &Path) -> Result<()> {
    let changes = fsutil::files_with_suffix(pkg, ".changes")?;
    for file in changes {
        let argv = vec![
            "debsign".to_string(),
            "--no-conf".to_string(),
            ctx.gpg.wrapper_arg("-p"),
            ctx.gpg.key_id_arg("-k"),
            "--debs-dir".to_string(),
            pkg.display().to_string(),
            file.display().to_string(),
        ];
        run_step(ctx, &argv, Some(pkg))
            .with_context(|| format!("failed to sign {}", file.display()))?;
    }
    Ok(())
}

/// Run one pipeline step in the configured output mode.
pub(crate) fn run_step(ctx: &BuildContext<'_>, argv: &[String], cwd: Option<&Path>) -> Result<()> {
    if ctx.verbose {
        run(ctx.token, argv, cwd)?;
    } else {
        run_quiet(ctx.token, argv, cwd)?;
    }
    Ok(())
}
