//! Typed error kinds with dedicated exit-code semantics.
//!
//! Pipelines propagate `anyhow::Error`; these types are the markers the
//! top-level handler downcasts to when mapping a failed run to an exit
//! code. Subprocess failures and cancellation are typed in
//! `repomason_process::RunError`.

use thiserror::Error;

use repomason_process::RunError;

/// Malformed configuration, unknown distribution, unsupported source
/// format, or conflicting package metadata.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// Network retries exhausted for a source download.
#[derive(Debug, Error)]
#[error("download failed after {attempts} attempts: {url}: {reason}")]
pub struct DownloadFailed {
    pub url: String,
    pub attempts: u32,
    pub reason: String,
}

/// Scheduler invariant violation: nodes are waiting but none can run.
#[derive(Debug, Error)]
#[error("dependency graph deadlocked: {waiting} packages waiting, none ready")]
pub struct DeadlockedGraph {
    pub waiting: usize,
}

/// True when the error (anywhere in its chain) is the cooperative-shutdown
/// marker rather than a real failure.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<RunError>(), Some(RunError::Cancelled)))
}

/// The subprocess failure in the error chain, if any.
pub fn subprocess_failure(err: &anyhow::Error) -> Option<&RunError> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<RunError>()
            .filter(|run| matches!(run, RunError::SubprocessFailed { .. }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_detected_through_context() {
        let err = anyhow::Error::new(RunError::Cancelled).context("while building foo");
        assert!(is_cancelled(&err));
    }

    #[test]
    fn subprocess_failure_is_found_in_chain() {
        let run = RunError::SubprocessFailed {
            argv: "false".into(),
            code: 1,
            output: String::new(),
        };
        let err = anyhow::Error::new(run).context("step 7");
        assert!(subprocess_failure(&err).is_some());
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn config_error_is_not_special_cased() {
        let err = anyhow::Error::new(ConfigError("bad yaml".into()));
        assert!(!is_cancelled(&err));
        assert!(subprocess_failure(&err).is_none());
    }
}
