//! # repomason
//!
//! Builds coherent sets of signed Debian-family and Fedora-family binary
//! package repositories from a declarative YAML configuration.
//!
//! For every configured (distribution, release) pair and every source
//! package found under the repository root, repomason derives a build-time
//! dependency graph from the packaging metadata, builds each package inside
//! a hermetic container with a transient signed repository of its
//! dependency closure mounted as a local package source, signs the
//! artifacts, and finally publishes aptly/createrepo-indexed repositories
//! ready for client consumption.
//!
//! ## Pipeline
//!
//! 1. [`config::Config::load`] reads `build.conf` into typed configuration.
//! 2. [`release`] resolves the configured release selectors against the
//!    built-in catalog and applies the `-D` filters.
//! 3. [`node::PackageNode::discover`] inspects each package directory
//!    (`debian/control` or `<name>.spec`) and extracts the provided and
//!    required binary-package names.
//! 4. [`linker::link`] wires the nodes into a DAG by matching provides to
//!    requires within each release.
//! 5. [`scheduler::execute`] runs the ready set in parallel with bounded
//!    concurrency and first-failure cancellation; each build goes through
//!    [`debian`] or [`rpm`].
//! 6. [`repo::RepoBuilder`] assembles the transient per-node local repos
//!    during the builds and the final signed user-facing repositories
//!    afterwards.
//!
//! Cancellation is cooperative throughout: every component receives a
//! [`repomason_process::CancelToken`] and checks it at each suspension
//! point. See the `repomason-process` crate for the runner contract.
//!
//! ## Modules
//!
//! - [`release`] — release catalog, selectors, `-D` filters
//! - [`config`] — typed `build.conf` loading
//! - [`gpg`] — isolated signing environment
//! - [`control`] — Debian control and changelog parsing
//! - [`node`] — package nodes and the build graph
//! - [`linker`] — provides→requires wiring and closures
//! - [`scheduler`] — ready-set parallel executor
//! - [`debian`], [`rpm`] — the per-node build pipelines
//! - [`download`] — cached, retrying source downloader
//! - [`repo`] — local and final repository assembly
//! - [`container`] — container runtime discovery and argv construction
//! - [`engine`] — top-level orchestration
//!
//! ## CLI Usage
//!
//! For command-line usage, see the `repomason-cli` crate.

pub mod config;
pub mod container;
pub mod control;
pub mod debian;
pub mod download;
pub mod engine;
pub mod errors;
mod fsutil;
pub mod gpg;
pub mod linker;
pub mod node;
pub mod release;
pub mod repo;
pub mod rpm;
pub mod scheduler;
