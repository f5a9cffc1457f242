//! Package nodes: the unit of scheduling and building.
//!
//! A node is one source package on one release. Construction inspects the
//! package directory to classify the source kind and extract the provided
//! and required binary-package names; the linker later wires the nodes into
//! a graph; the scheduler drives [`PackageNode::build`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result};

use repomason_process::{CancelToken, run_stdout};

use crate::config::PackageConfig;
use crate::container::ContainerRuntime;
use crate::control;
use crate::debian;
use crate::download::Downloader;
use crate::engine::Reporter;
use crate::errors::ConfigError;
use crate::gpg::GpgContext;
use crate::release::Release;
use crate::rpm;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `debian/control` present; the quilt/native split is resolved by
    /// `dpkg-source --print-format` at build time.
    Debian,
    /// `<name>.spec` present.
    Rpm,
    /// Neither; building trivially skips.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Building,
    Finished { outdir: PathBuf },
    Skipped,
    Failed,
    Cancelled,
}

impl NodeState {
    /// Terminal and satisfying for dependents.
    pub fn is_complete(&self) -> bool {
        matches!(self, NodeState::Finished { .. } | NodeState::Skipped)
    }
}

/// Everything a build needs besides the node itself.
pub struct BuildContext<'a> {
    pub token: &'a CancelToken,
    pub gpg: &'a GpgContext,
    pub graph: &'a BuildGraph,
    pub downloader: &'a Downloader,
    pub runtime: &'a ContainerRuntime,
    pub registry: &'a str,
    pub work_root: &'a Path,
    pub verbose: bool,
    pub reporter: Arc<Mutex<dyn Reporter + Send>>,
}

pub struct PackageNode {
    pub name: String,
    pub release: Release,
    pub kind: SourceKind,
    /// The source package directory under the repo root.
    pub source_dir: PathBuf,
    pub bin_provides: BTreeSet<String>,
    pub bin_requires: BTreeSet<String>,
    pub orig_url: Option<String>,
    /// Inner build concurrency, forwarded into the builder container.
    pub parallelism: u32,
    deps: OnceLock<Vec<NodeId>>,
    state: Mutex<NodeState>,
}

impl PackageNode {
    /// Inspect `<repo_root>/<name>` and construct the node for `release`.
    pub fn discover(
        token: &CancelToken,
        repo_root: &Path,
        name: &str,
        release: Release,
        cfg: &PackageConfig,
        default_parallelism: u32,
    ) -> Result<Self> {
        let source_dir = repo_root.join(name);
        let control_path = source_dir.join("debian/control");
        let spec_path = source_dir.join(format!("{name}.spec"));

        let (kind, provides, requires) = if control_path.is_file() {
            let text = std::fs::read_to_string(&control_path)
                .with_context(|| format!("failed to read {}", control_path.display()))?;
            let control = control::parse_control(&text);
            (
                SourceKind::Debian,
                control.binaries.into_iter().collect(),
                control.build_depends.into_iter().collect(),
            )
        } else if spec_path.is_file() {
            let provides = rpm_query(token, &spec_path, "--provides")?;
            let requires = rpm_query(token, &spec_path, "--buildrequires")?;
            (SourceKind::Rpm, provides, requires)
        } else {
            (SourceKind::Absent, BTreeSet::new(), BTreeSet::new())
        };

        Ok(Self {
            name: name.to_string(),
            release,
            kind,
            source_dir,
            bin_provides: provides,
            bin_requires: requires,
            orig_url: cfg.orig.clone(),
            parallelism: cfg.parallelism.unwrap_or(default_parallelism),
            deps: OnceLock::new(),
            state: Mutex::new(NodeState::Pending),
        })
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().unwrap().clone()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.lock().unwrap() = state;
    }

    /// Captured artifacts, populated by a successful build.
    pub fn outdir(&self) -> Option<PathBuf> {
        match &*self.state.lock().unwrap() {
            NodeState::Finished { outdir } => Some(outdir.clone()),
            _ => None,
        }
    }

    /// True once the linker has resolved this node's dependencies. An
    /// unlinked node is never ready.
    pub fn resolved(&self) -> bool {
        self.deps.get().is_some()
    }

    pub fn depends_on(&self) -> &[NodeId] {
        self.deps.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn resolve(&self, deps: Vec<NodeId>) -> Result<(), ConfigError> {
        self.deps
            .set(deps)
            .map_err(|_| ConfigError(format!("{} linked twice", self.name)))
    }

    /// The per-node pipeline. Leaves the node `Finished` or `Skipped`;
    /// errors propagate to the scheduler, which records the failed state.
    pub fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        ctx.token.check()?;
        match self.kind {
            SourceKind::Absent => {
                self.set_state(NodeState::Skipped);
            }
            SourceKind::Debian => {
                let outdir = debian::build(self, ctx)
                    .with_context(|| format!("{} on {}", self.name, self.release))?;
                self.set_state(NodeState::Finished { outdir });
            }
            SourceKind::Rpm => {
                let outdir = rpm::build(self, ctx)
                    .with_context(|| format!("{} on {}", self.name, self.release))?;
                self.set_state(NodeState::Finished { outdir });
            }
        }
        ctx.token.check()?;
        Ok(())
    }
}

/// Query the spec file for provided or required package names.
fn rpm_query(token: &CancelToken, spec: &Path, what: &str) -> Result<BTreeSet<String>> {
    let argv = vec![
        "rpmspec".to_string(),
        "-q".to_string(),
        what.to_string(),
        spec.display().to_string(),
    ];
    let out = run_stdout(token, &argv, None)
        .with_context(|| format!("failed to query {} of {}", what, spec.display()))?;
    Ok(out.lines().filter_map(bare_name).collect())
}

/// Strip everything from the first `(` or whitespace onward:
/// `pkgconfig(libfoo) >= 1.2` becomes `pkgconfig`.
pub(crate) fn bare_name(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let end = line
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(line.len());
    if end == 0 {
        None
    } else {
        Some(line[..end].to_string())
    }
}

/// All nodes of one invocation.
pub struct BuildGraph {
    nodes: Vec<Arc<PackageNode>>,
}

impl BuildGraph {
    pub fn new(nodes: Vec<PackageNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Arc<PackageNode> {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Arc<PackageNode>)> {
        self.nodes.iter().enumerate()
    }

    /// Ready to build: still pending, linked, and all dependencies complete.
    pub fn ready(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if node.state() != NodeState::Pending || !node.resolved() {
            return false;
        }
        node.depends_on()
            .iter()
            .all(|&dep| self.nodes[dep].state().is_complete())
    }
}
