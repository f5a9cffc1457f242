//! Container runtime discovery and invocation argv construction.
//!
//! Builds run in `<registry>/<distro_id>_builder:<tag>` images; repository
//! indexing runs in `<registry>/rpm_tools`. Either podman or docker drives
//! them, whichever is installed (podman preferred).

use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: PathBuf,
}

/// One `host:guest` bind mount.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub guest: &'static str,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, guest: &'static str) -> Self {
        Self {
            host: host.into(),
            guest,
        }
    }
}

impl ContainerRuntime {
    /// Locate podman or docker on PATH.
    pub fn detect() -> Result<Self, ConfigError> {
        which::which("podman")
            .or_else(|_| which::which("docker"))
            .map(|program| Self { program })
            .map_err(|_| ConfigError("neither podman nor docker found on PATH".to_string()))
    }

    #[cfg(test)]
    fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Argv for one containerized build or indexing step: transient
    /// container, the given bind mounts, an executable `/tmp`, and a 5g
    /// `/dev/shm` for the heavyweight packaging tools.
    pub fn run_argv(
        &self,
        image: &str,
        mounts: &[Mount],
        user: Option<&str>,
        inner: &[String],
    ) -> Vec<String> {
        let mut argv = vec![
            self.program.display().to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--tmpfs".to_string(),
            "/tmp:exec".to_string(),
            "--shm-size".to_string(),
            "5g".to_string(),
        ];
        if let Some(user) = user {
            argv.push("--user".to_string());
            argv.push(user.to_string());
        }
        for mount in mounts {
            argv.push("-v".to_string());
            argv.push(format!("{}:{}", mount.host.display(), mount.guest));
        }
        argv.push(image.to_string());
        argv.extend(inner.iter().cloned());
        argv
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// `<registry>/<distro_id>_builder:<tag>`.
pub fn builder_image(registry: &str, distro_id: &str, tag: &str) -> String {
    format!("{registry}/{distro_id}_builder:{tag}")
}

/// `<registry>/rpm_tools`, the small indexing image.
pub fn rpm_tools_image(registry: &str) -> String {
    format!("{registry}/rpm_tools")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_argv_layout() {
        let runtime = ContainerRuntime::with_program("podman");
        let mounts = [
            Mount::new("/work/pkg", "/src"),
            Mount::new("/work/repo", "/localrepo"),
        ];
        let argv = runtime.run_argv(
            "ghcr.io/pdidev/debian_builder:bookworm",
            &mounts,
            None,
            &["-j8".to_string(), "-sa".to_string()],
        );
        assert_eq!(
            argv,
            vec![
                "podman",
                "run",
                "--rm",
                "--tmpfs",
                "/tmp:exec",
                "--shm-size",
                "5g",
                "-v",
                "/work/pkg:/src",
                "-v",
                "/work/repo:/localrepo",
                "ghcr.io/pdidev/debian_builder:bookworm",
                "-j8",
                "-sa",
            ]
        );
    }

    #[test]
    fn run_argv_with_user() {
        let runtime = ContainerRuntime::with_program("docker");
        let argv = runtime.run_argv(
            "ghcr.io/pdidev/rpm_tools",
            &[Mount::new("/out/38", "/repo")],
            Some("1000:1000"),
            &["createrepo_c".to_string(), "/repo".to_string()],
        );
        assert!(argv.contains(&"--user".to_string()));
        assert!(argv.contains(&"1000:1000".to_string()));
        assert_eq!(argv.last().unwrap(), "/repo");
    }

    #[test]
    fn image_names() {
        assert_eq!(
            builder_image("ghcr.io/pdidev", "fedora", "38"),
            "ghcr.io/pdidev/fedora_builder:38"
        );
        assert_eq!(rpm_tools_image("ghcr.io/pdidev"), "ghcr.io/pdidev/rpm_tools");
    }
}
