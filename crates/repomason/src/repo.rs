//! Signed repository assembly.
//!
//! One implementation serves two callers: the per-node transient local
//! repo (the dependency closure, mounted into the build container as a
//! package source) and the final user-facing repositories published after
//! the whole graph has completed. The Debian branch drives aptly through a
//! generated private configuration; the RPM branch lays out
//! `<numeric-id>/<arch>/` trees and indexes them with createrepo inside
//! the `rpm_tools` container.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;

use repomason_process::{CancelToken, run, run_quiet, run_stdout};

use crate::config::RepositoryConfig;
use crate::container::{ContainerRuntime, Mount, rpm_tools_image};
use crate::errors::ConfigError;
use crate::fsutil;
use crate::gpg::GpgContext;
use crate::linker;
use crate::node::{BuildContext, BuildGraph, PackageNode};
use crate::release::Release;

/// One finished node's contribution: its release and captured artifacts.
#[derive(Debug, Clone)]
pub struct RepoArtifact {
    pub release: Release,
    pub outdir: PathBuf,
}

/// What to assemble and where.
pub struct RepoRequest<'a> {
    pub artifacts: Vec<RepoArtifact>,
    pub out_dir: &'a Path,
    pub name: &'a str,
    /// Public base URL. Enables keyring export and README/INSTALL
    /// rendering; transient local repos leave it unset.
    pub url: Option<&'a str>,
    pub description: &'a str,
}

pub struct RepoBuilder<'a> {
    pub token: &'a CancelToken,
    pub gpg: &'a GpgContext,
    pub runtime: &'a ContainerRuntime,
    pub registry: &'a str,
    pub verbose: bool,
}

impl RepoBuilder<'_> {
    /// Assemble signed repositories for every artifact, split by family.
    pub fn assemble(&self, req: &RepoRequest<'_>) -> Result<()> {
        fs::create_dir_all(req.out_dir)
            .with_context(|| format!("failed to create {}", req.out_dir.display()))?;

        let debian: Vec<&RepoArtifact> = req
            .artifacts
            .iter()
            .filter(|a| a.release.family.is_debian_like())
            .collect();
        let rpm: Vec<&RepoArtifact> = req
            .artifacts
            .iter()
            .filter(|a| a.release.family.is_fedora_like())
            .collect();

        if !debian.is_empty() {
            self.assemble_debian(req, &debian)?;
        }
        if !rpm.is_empty() {
            self.assemble_rpm(req, &rpm)?;
        }
        if req.url.is_some() {
            let readme = render_readme(req);
            fs::write(req.out_dir.join("README.md"), readme)?;
        }
        Ok(())
    }

    fn assemble_debian(&self, req: &RepoRequest<'_>, artifacts: &[&RepoArtifact]) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("repomason-aptly.")
            .tempdir()
            .context("failed to create aptly scratch root")?;
        let conf_path = scratch.path().join("aptly.conf");
        let conf = aptly_conf(&scratch.path().join("root"), req.out_dir);
        fs::write(&conf_path, serde_json::to_string_pretty(&conf)?)?;

        for (release, outdirs) in by_release(artifacts) {
            let distribution = release
                .codename
                .clone()
                .unwrap_or_else(|| release.numeric_id.clone());
            self.publish_repo(&conf_path, req, &release, &release.uid(), &distribution, &outdirs)?;
            if let Some(suite) = &release.suite {
                let alias = format!("{}:{}", release.uid(), suite);
                self.publish_repo(&conf_path, req, &release, &alias, suite, &outdirs)?;
            }
        }

        if req.url.is_some() {
            let keyring = req.out_dir.join(format!("{}-archive-keyring.gpg", req.name));
            self.gpg.export_public_key(self.token, &keyring)?;
        }
        Ok(())
    }

    /// Create one aptly repo, add every outdir (no-remove mode), and
    /// publish it to the filesystem endpoint.
    fn publish_repo(
        &self,
        conf: &Path,
        req: &RepoRequest<'_>,
        release: &Release,
        repo_name: &str,
        distribution: &str,
        outdirs: &[PathBuf],
    ) -> Result<()> {
        self.aptly(
            conf,
            &[
                "repo",
                "create",
                &format!("-distribution={distribution}"),
                "-component=main",
                repo_name,
            ],
        )?;
        for outdir in outdirs {
            self.aptly(
                conf,
                &[
                    "repo",
                    "add",
                    "-remove-files=false",
                    repo_name,
                    &outdir.display().to_string(),
                ],
            )
            .with_context(|| format!("failed to add {} for {}", outdir.display(), release))?;
        }

        let keyring = self.gpg.keyring().display().to_string();
        let mut publish: Vec<String> = vec![
            "publish".into(),
            "repo".into(),
            "-batch".into(),
            format!("-keyring={keyring}"),
            self.gpg.short_key_id_arg("-gpg-key="),
            self.gpg.passphrase_arg("-passphrase="),
        ];
        if req.url.is_some() {
            publish.push(format!("-label={}", req.name));
            publish.push(format!("-origin={}", req.name));
        }
        publish.push(format!("-distribution={distribution}"));
        publish.push(repo_name.to_string());
        publish.push("filesystem:default:.".to_string());
        let publish_refs: Vec<&str> = publish.iter().map(String::as_str).collect();
        self.aptly(conf, &publish_refs)
    }

    fn aptly(&self, conf: &Path, args: &[&str]) -> Result<()> {
        let mut argv = vec![
            "aptly".to_string(),
            format!("-config={}", conf.display()),
        ];
        argv.extend(args.iter().map(|s| s.to_string()));
        if self.verbose {
            run(self.token, &argv, None)?;
        } else {
            run_quiet(self.token, &argv, None)?;
        }
        Ok(())
    }

    fn assemble_rpm(&self, req: &RepoRequest<'_>, artifacts: &[&RepoArtifact]) -> Result<()> {
        let releases = place_rpms(artifacts, req.out_dir)?;

        let key_name = format!("{}.key", req.name);
        let key_path = req.out_dir.join(&key_name);
        self.gpg.export_public_key(self.token, &key_path)?;

        let user = current_user_spec(self.token)?;
        for (numeric, release) in &releases {
            let release_dir = req.out_dir.join(numeric);

            let argv = self.runtime.run_argv(
                &rpm_tools_image(self.registry),
                &[Mount::new(&release_dir, "/repo")],
                Some(&user),
                &["createrepo_c".to_string(), "/repo".to_string()],
            );
            if self.verbose {
                run(self.token, &argv, None)?;
            } else {
                run_quiet(self.token, &argv, None)?;
            }

            let repomd = release_dir.join("repodata/repomd.xml");
            let signature = release_dir.join("repodata/repomd.xml.asc");
            let mut sign = vec![
                self.gpg.wrapper().display().to_string(),
                "--yes".to_string(),
                "--armor".to_string(),
                "--detach-sign".to_string(),
            ];
            sign.extend(self.gpg.key_id_args(&["--local-user"]));
            sign.extend([
                "--output".to_string(),
                signature.display().to_string(),
                repomd.display().to_string(),
            ]);
            run_quiet(self.token, &sign, None)
                .with_context(|| format!("failed to sign {}", repomd.display()))?;

            if req.url.is_none() {
                // Local repos are mounted at their release directory; the
                // key must be reachable inside the mount.
                fsutil::link_or_copy(&key_path, &release_dir.join(&key_name))?;
            }

            let (baseurl, gpgkey) = match req.url {
                Some(url) => (
                    format!("{url}/{numeric}"),
                    format!("{url}/{key_name}"),
                ),
                None => (
                    "file:///localrepo".to_string(),
                    format!("file:///localrepo/{key_name}"),
                ),
            };
            let repo_file = render_repo_file(req.name, req.description, &baseurl, &gpgkey);
            fs::write(
                release_dir.join(format!("{}.repo", req.name)),
                repo_file,
            )
            .with_context(|| format!("failed to write repo file for {release}"))?;
        }
        Ok(())
    }
}

/// Build the transient local repo for one node: the signed artifacts of
/// its transitive dependency closure, excluding the node itself.
pub fn build_local_repo(ctx: &BuildContext<'_>, node: &PackageNode, out_dir: &Path) -> Result<()> {
    let id = ctx
        .graph
        .nodes()
        .find(|(_, n)| std::ptr::eq(n.as_ref(), node))
        .map(|(id, _)| id)
        .ok_or_else(|| ConfigError(format!("{} is not part of the build graph", node.name)))?;

    let mut closure = linker::closure(ctx.graph, id);
    closure.remove(&id);

    let artifacts: Vec<RepoArtifact> = closure
        .into_iter()
        .filter_map(|dep| {
            let dep = ctx.graph.node(dep);
            dep.outdir().map(|outdir| RepoArtifact {
                release: dep.release.clone(),
                outdir,
            })
        })
        .collect();

    let builder = RepoBuilder {
        token: ctx.token,
        gpg: ctx.gpg,
        runtime: ctx.runtime,
        registry: ctx.registry,
        verbose: ctx.verbose,
    };
    builder.assemble(&RepoRequest {
        artifacts,
        out_dir,
        name: "local",
        url: None,
        description: "transient build-time repository",
    })
}

/// Publish the final user-facing repositories from every finished node.
pub fn publish_final(
    builder: &RepoBuilder<'_>,
    graph: &BuildGraph,
    repository: &RepositoryConfig,
) -> Result<()> {
    let artifacts: Vec<RepoArtifact> = graph
        .nodes()
        .filter_map(|(_, node)| {
            node.outdir().map(|outdir| RepoArtifact {
                release: node.release.clone(),
                outdir,
            })
        })
        .collect();

    builder.assemble(&RepoRequest {
        artifacts,
        out_dir: &repository.path,
        name: &repository.name,
        url: repository.url.as_deref(),
        description: repository.description.as_deref().unwrap_or(&repository.name),
    })
}

fn by_release<'a>(artifacts: &[&'a RepoArtifact]) -> BTreeMap<Release, Vec<PathBuf>> {
    let mut out: BTreeMap<Release, Vec<PathBuf>> = BTreeMap::new();
    for artifact in artifacts {
        out.entry(artifact.release.clone())
            .or_default()
            .push(artifact.outdir.clone());
    }
    out
}

/// The private aptly configuration: scratch database root plus a
/// filesystem publish endpoint rooted at the output directory.
fn aptly_conf(root_dir: &Path, publish_dir: &Path) -> serde_json::Value {
    json!({
        "rootDir": root_dir.display().to_string(),
        "downloadConcurrency": 4,
        "gpgDisableSign": false,
        "gpgDisableVerify": true,
        "gpgProvider": "gpg",
        "FileSystemPublishEndpoints": {
            "default": {
                "rootDir": publish_dir.display().to_string(),
                "linkMethod": "hardlink",
                "verifyMethod": "md5",
            }
        }
    })
}

/// Hardlink every rpm into `<out>/<numeric-id>/<arch>/`, keyed by the
/// arch suffix of the filename. Returns the releases that received files.
fn place_rpms(
    artifacts: &[&RepoArtifact],
    out_dir: &Path,
) -> Result<BTreeMap<String, Release>> {
    let mut releases: BTreeMap<String, Release> = BTreeMap::new();
    for artifact in artifacts {
        let rpms = fsutil::files_with_suffix(&artifact.outdir, ".rpm")?;
        for rpm in rpms {
            let filename = rpm
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let arch = arch_of(&filename).ok_or_else(|| {
                ConfigError(format!("cannot derive architecture from {filename}"))
            })?;
            let arch_dir = out_dir.join(&artifact.release.numeric_id).join(arch);
            fs::create_dir_all(&arch_dir)?;
            fsutil::link_or_copy(&rpm, &arch_dir.join(&filename))?;
        }
        releases.insert(
            artifact.release.numeric_id.clone(),
            artifact.release.clone(),
        );
    }
    Ok(releases)
}

/// `uid:gid` of the invoking user, for running the indexer container
/// without root-owned output.
fn current_user_spec(token: &CancelToken) -> Result<String> {
    let uid = run_stdout(token, &["id".to_string(), "-u".to_string()], None)?;
    let gid = run_stdout(token, &["id".to_string(), "-g".to_string()], None)?;
    Ok(format!(
        "{}:{}",
        uid.lines().next().unwrap_or("").trim(),
        gid.lines().next().unwrap_or("").trim()
    ))
}

/// The architecture component of an rpm filename: the second-to-last
/// dotted suffix (`libfoo-1.2-1.fc38.x86_64.rpm` → `x86_64`).
pub(crate) fn arch_of(filename: &str) -> Option<&str> {
    let mut parts = filename.rsplit('.');
    match (parts.next(), parts.next()) {
        (Some("rpm"), Some(arch)) if !arch.is_empty() => Some(arch),
        _ => None,
    }
}

fn render_repo_file(name: &str, description: &str, baseurl: &str, gpgkey: &str) -> String {
    format!(
        "[{name}]\nname={description}\ntype=rpm-md\nbaseurl={baseurl}\ngpgcheck=1\nrepo_gpgcheck=1\ngpgkey={gpgkey}\nenabled=1\n"
    )
}

const DEB_INSTALL_TEMPLATE: &str = "\
## {dist_release}

```sh
curl -fsSL {baseurl}/{keyring} -o /usr/share/keyrings/{keyring}
echo \"deb [signed-by=/usr/share/keyrings/{keyring}] {baseurl} {codename} main\" \\
  > /etc/apt/sources.list.d/{name}.list
apt update
```
";

const RPM_INSTALL_TEMPLATE: &str = "\
## {dist_release}

```sh
curl -fsSL {baseurl}/{numeric_id}/{name}.repo -o /etc/yum.repos.d/{name}.repo
dnf makecache
```
";

/// One install snippet per release, substituted from the templates.
fn render_install_snippet(req: &RepoRequest<'_>, release: &Release) -> String {
    let baseurl = req.url.unwrap_or("");
    if release.family.is_debian_like() {
        DEB_INSTALL_TEMPLATE
            .replace("{dist_release}", &release.to_string())
            .replace("{baseurl}", baseurl)
            .replace("{keyring}", &format!("{}-archive-keyring.gpg", req.name))
            .replace(
                "{codename}",
                release.codename.as_deref().unwrap_or(&release.numeric_id),
            )
            .replace("{name}", req.name)
    } else {
        RPM_INSTALL_TEMPLATE
            .replace("{dist_release}", &release.to_string())
            .replace("{baseurl}", baseurl)
            .replace("{numeric_id}", &release.numeric_id)
            .replace("{name}", req.name)
    }
}

fn render_readme(req: &RepoRequest<'_>) -> String {
    let mut releases: Vec<Release> = Vec::new();
    for artifact in &req.artifacts {
        if !releases.contains(&artifact.release) {
            releases.push(artifact.release.clone());
        }
    }
    releases.sort();

    let mut out = format!("# {}\n\n{}\n", req.name, req.description);
    for release in &releases {
        out.push('\n');
        out.push_str(&render_install_snippet(req, release));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::releases_of;

    fn fedora38() -> Release {
        releases_of("fedora")
            .into_iter()
            .find(|r| r.numeric_id == "38")
            .unwrap()
    }

    fn bookworm() -> Release {
        releases_of("debian")
            .into_iter()
            .find(|r| r.numeric_id == "12")
            .unwrap()
    }

    #[test]
    fn arch_is_second_to_last_suffix() {
        assert_eq!(arch_of("libfoo-1.2-1.fc38.x86_64.rpm"), Some("x86_64"));
        assert_eq!(arch_of("docs-1.0-1.noarch.rpm"), Some("noarch"));
        assert_eq!(arch_of("libfoo-1.2-1.fc38.src.rpm"), Some("src"));
        assert_eq!(arch_of("not-an-rpm.tar.gz"), None);
        assert_eq!(arch_of("bare.rpm"), Some("bare"));
        assert_eq!(arch_of(""), None);
    }

    #[test]
    fn aptly_conf_points_endpoints_at_output() {
        let conf = aptly_conf(Path::new("/scratch/root"), Path::new("/srv/out"));
        assert_eq!(conf["rootDir"], "/scratch/root");
        assert_eq!(
            conf["FileSystemPublishEndpoints"]["default"]["rootDir"],
            "/srv/out"
        );
    }

    #[test]
    fn place_rpms_lays_out_numeric_arch_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outdir = dir.path().join("node-out");
        fs::create_dir_all(&outdir).unwrap();
        fs::write(outdir.join("libfoo-1.2-1.fc38.x86_64.rpm"), "rpm").unwrap();
        fs::write(outdir.join("libfoo-doc-1.2-1.noarch.rpm"), "rpm").unwrap();
        fs::write(outdir.join("libfoo-1.2-1.fc38.src.rpm"), "rpm").unwrap();
        fs::write(outdir.join("stray.log"), "ignored").unwrap();

        let artifact = RepoArtifact {
            release: fedora38(),
            outdir,
        };
        let out = dir.path().join("repo");
        let releases = place_rpms(&[&artifact], &out).expect("place");

        assert!(releases.contains_key("38"));
        assert!(out.join("38/x86_64/libfoo-1.2-1.fc38.x86_64.rpm").exists());
        assert!(out.join("38/noarch/libfoo-doc-1.2-1.noarch.rpm").exists());
        assert!(out.join("38/src/libfoo-1.2-1.fc38.src.rpm").exists());
        assert!(!out.join("38/x86_64/stray.log").exists());
    }

    #[test]
    fn place_rpms_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outdir = dir.path().join("node-out");
        fs::create_dir_all(&outdir).unwrap();
        fs::write(outdir.join("a-1.0-1.fc38.x86_64.rpm"), "rpm").unwrap();
        let artifact = RepoArtifact {
            release: fedora38(),
            outdir,
        };
        let out = dir.path().join("repo");
        place_rpms(&[&artifact], &out).expect("first");
        place_rpms(&[&artifact], &out).expect("second");
        assert!(out.join("38/x86_64/a-1.0-1.fc38.x86_64.rpm").exists());
    }

    #[test]
    fn repo_file_shape() {
        let text = render_repo_file(
            "pdi",
            "PDI packages",
            "https://repo.example.org/pdi/38",
            "https://repo.example.org/pdi/pdi.key",
        );
        assert!(text.starts_with("[pdi]\n"));
        assert!(text.contains("name=PDI packages\n"));
        assert!(text.contains("type=rpm-md\n"));
        assert!(text.contains("baseurl=https://repo.example.org/pdi/38\n"));
        assert!(text.contains("gpgcheck=1\n"));
        assert!(text.contains("repo_gpgcheck=1\n"));
        assert!(text.contains("gpgkey=https://repo.example.org/pdi/pdi.key\n"));
        assert!(text.ends_with("enabled=1\n"));
    }

    #[test]
    fn readme_covers_every_release_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = RepoRequest {
            artifacts: vec![
                RepoArtifact {
                    release: bookworm(),
                    outdir: dir.path().join("a"),
                },
                RepoArtifact {
                    release: bookworm(),
                    outdir: dir.path().join("b"),
                },
                RepoArtifact {
                    release: fedora38(),
                    outdir: dir.path().join("c"),
                },
            ],
            out_dir: dir.path(),
            name: "pdi",
            url: Some("https://repo.example.org/pdi"),
            description: "PDI development packages",
        };

        let readme = render_readme(&req);
        assert!(readme.starts_with("# pdi\n"));
        assert!(readme.contains("PDI development packages"));
        assert_eq!(readme.matches("## debian bookworm").count(), 1);
        assert_eq!(readme.matches("## fedora 38").count(), 1);
        assert!(readme.contains("signed-by=/usr/share/keyrings/pdi-archive-keyring.gpg"));
        assert!(readme.contains("https://repo.example.org/pdi/38/pdi.repo"));
        assert!(readme.contains("bookworm main"));
    }

    #[test]
    fn readme_rendering_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = RepoRequest {
            artifacts: vec![RepoArtifact {
                release: bookworm(),
                outdir: dir.path().join("a"),
            }],
            out_dir: dir.path(),
            name: "pdi",
            url: Some("https://repo.example.org/pdi"),
            description: "desc",
        };
        assert_eq!(render_readme(&req), render_readme(&req));
    }
}
