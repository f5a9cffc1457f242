//! Top-level orchestration: configuration → releases → nodes → linker →
//! scheduler → final publish, per configured distribution.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::TempDir;

use repomason_process::CancelToken;

use crate::config::{Config, DistribConfig};
use crate::container::ContainerRuntime;
use crate::download::Downloader;
use crate::errors::ConfigError;
use crate::gpg::GpgContext;
use crate::linker;
use crate::node::{BuildContext, BuildGraph, PackageNode};
use crate::release::{self, DistFilter, Release};
use crate::repo::{self, RepoBuilder};
use crate::scheduler;

/// Progress sink implemented by the caller (the CLI writes to stderr).
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Everything the run needs from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub passphrase: String,
    /// Inherit child output; forces a pool size of 1.
    pub verbose: bool,
    /// Prompt before cleaning the work directory after a failure.
    pub interactive: bool,
    /// Scheduler pool size; defaults to CPUs + 1.
    pub jobs: Option<usize>,
    pub filters: Vec<DistFilter>,
}

/// Execute the whole invocation.
pub fn run(
    token: &CancelToken,
    opts: &RunOptions,
    reporter: Arc<Mutex<dyn Reporter + Send>>,
) -> Result<()> {
    let config = Config::load(&opts.config_path)?;
    let repo_root = opts
        .config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let jobs = if opts.verbose {
        1
    } else {
        opts.jobs.unwrap_or_else(|| num_cpus::get() + 1)
    };
    let default_parallelism = num_cpus::get() as u32;

    let mut matched = false;
    for (name, distrib) in &config.distribs {
        if !release::distrib_selected(&opts.filters, name) {
            continue;
        }
        matched = true;

        let releases = select_releases(name, distrib, &opts.filters)?;
        if releases.is_empty() {
            reporter
                .lock()
                .unwrap()
                .warn(&format!("{name}: no releases selected, skipping"));
            continue;
        }

        let runtime = ContainerRuntime::detect()?;
        let gpg = GpgContext::new(token, &distrib.gpg, &opts.passphrase)?;
        reporter.lock().unwrap().info(&format!(
            "{name}: signing as {} ({})",
            gpg.uid(),
            gpg.short_key_id()
        ));

        let mut nodes: Vec<PackageNode> = Vec::new();
        for release in &releases {
            for pkg_name in config.packages.keys() {
                let pkg_cfg = config.package(pkg_name);
                if pkg_cfg.disabled_on(release) {
                    continue;
                }
                nodes.push(PackageNode::discover(
                    token,
                    &repo_root,
                    pkg_name,
                    release.clone(),
                    &pkg_cfg,
                    default_parallelism,
                )?);
            }
        }
        let graph = BuildGraph::new(nodes);
        linker::link(&graph)?;
        reporter.lock().unwrap().info(&format!(
            "{name}: {} package builds across {} releases (pool size {jobs})",
            graph.len(),
            releases.len()
        ));

        let work_root = tempfile::Builder::new().prefix("repomason.").tempdir()?;
        let downloader = Downloader::new(work_root.path().join("download-cache"))?;
        let ctx = BuildContext {
            token,
            gpg: &gpg,
            graph: &graph,
            downloader: &downloader,
            runtime: &runtime,
            registry: &distrib.registry,
            work_root: work_root.path(),
            verbose: opts.verbose,
            reporter: Arc::clone(&reporter),
        };

        let result = scheduler::execute(&graph, jobs, token, &reporter, |id| {
            graph.node(id).build(&ctx)
        })
        .and_then(|()| {
            let builder = RepoBuilder {
                token,
                gpg: &gpg,
                runtime: &runtime,
                registry: &distrib.registry,
                verbose: opts.verbose,
            };
            repo::publish_final(&builder, &graph, &distrib.repository)
        });

        match result {
            Ok(()) => {
                reporter.lock().unwrap().info(&format!(
                    "{name}: published to {}",
                    distrib.repository.path.display()
                ));
            }
            Err(err) => {
                retain_work_root(work_root, opts.interactive, &reporter);
                return Err(err);
            }
        }
    }

    if !matched {
        return Err(ConfigError("distribution filters matched no configured distrib".into()).into());
    }
    Ok(())
}

/// Resolve and filter the configured releases of one distrib entry.
pub(crate) fn select_releases(
    name: &str,
    distrib: &DistribConfig,
    filters: &[DistFilter],
) -> Result<Vec<Release>, ConfigError> {
    let mut releases: Vec<Release> = Vec::new();
    for (distro_id, selectors) in &distrib.versions {
        let selectors: Vec<String> = selectors.iter().map(ToString::to_string).collect();
        for release in release::resolve_selectors(distro_id, &selectors)? {
            if release::release_selected(filters, name, &release) && !releases.contains(&release) {
                releases.push(release);
            }
        }
    }
    releases.sort();
    Ok(releases)
}

/// Partial artifacts are left behind for post-mortem inspection; in
/// interactive mode the user decides when they have seen enough.
fn retain_work_root(
    work_root: TempDir,
    interactive: bool,
    reporter: &Arc<Mutex<dyn Reporter + Send>>,
) {
    if interactive {
        reporter.lock().unwrap().error(&format!(
            "build failed; work directory at {}; press Enter to clean up",
            work_root.path().display()
        ));
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        drop(work_root);
    } else {
        let kept = work_root.keep();
        reporter.lock().unwrap().error(&format!(
            "build failed; work directory kept at {}",
            kept.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;

    const CONF: &str = r#"
distribs:
  pdi:
    gpg: { file: key.asc }
    versions:
      debian: [bullseye, bookworm]
      ubuntu: [focal]
    repository:
      path: out
      name: pdi
"#;

    fn config() -> Config {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("build.conf");
        fs::write(&path, CONF).expect("write");
        Config::load(&path).expect("load")
    }

    #[test]
    fn select_releases_unfiltered_takes_everything() {
        let config = config();
        let releases = select_releases("pdi", &config.distribs["pdi"], &[]).expect("select");
        let uids: Vec<String> = releases.iter().map(Release::uid).collect();
        assert_eq!(
            uids,
            vec!["debian-bullseye", "debian-bookworm", "ubuntu-focal"]
        );
    }

    #[test]
    fn select_releases_applies_dist_filters() {
        let config = config();
        let filter = DistFilter::parse("pdi:bookworm").expect("parse");
        let releases =
            select_releases("pdi", &config.distribs["pdi"], &[filter]).expect("select");
        let uids: Vec<String> = releases.iter().map(Release::uid).collect();
        assert_eq!(uids, vec!["debian-bookworm"]);
    }

    #[test]
    fn select_releases_filter_by_distro_name() {
        let config = config();
        let filter = DistFilter::parse("pdi:debian").expect("parse");
        let releases =
            select_releases("pdi", &config.distribs["pdi"], &[filter]).expect("select");
        assert!(releases.iter().all(|r| r.distro_id == "debian"));
        assert_eq!(releases.len(), 2);
    }

    #[test]
    fn select_releases_mismatched_filter_is_empty() {
        let config = config();
        let filter = DistFilter::parse("other").expect("parse");
        let releases =
            select_releases("pdi", &config.distribs["pdi"], &[filter]).expect("select");
        assert!(releases.is_empty());
    }
}
