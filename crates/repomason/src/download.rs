//! Cached, retrying source downloader.
//!
//! Downloads land in a URL-keyed cache first and are hardlinked to their
//! destination. Concurrent requests for one URL coalesce: the first caller
//! downloads while late arrivals block on the completion slot, so a source
//! shared by several package builds is fetched once.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use repomason_process::CancelToken;

use crate::errors::DownloadFailed;
use crate::fsutil;

/// Sleep, in seconds, before each retry. Exhaustion is a permanent
/// [`DownloadFailed`].
const RETRY_DELAYS: [u64; 5] = [1, 2, 3, 5, 7];

enum SlotState {
    Pending,
    Done(PathBuf),
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

pub struct Downloader {
    client: reqwest::blocking::Client,
    cache_dir: PathBuf,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Downloader {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create {}", cache_dir.display()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            cache_dir,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch `url` into `dest`. First downloader wins; everyone else waits
    /// for completion and links from the cache.
    pub fn fetch(&self, token: &CancelToken, url: &str, dest: &Path) -> Result<()> {
        token.check()?;

        let (slot, owner) = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(url) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot {
                        state: Mutex::new(SlotState::Pending),
                        ready: Condvar::new(),
                    });
                    slots.insert(url.to_string(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        let cached = if owner {
            let result = self.download_with_retry(token, url);
            let mut state = slot.state.lock().unwrap();
            match &result {
                Ok(path) => *state = SlotState::Done(path.clone()),
                Err(e) => *state = SlotState::Failed(format!("{e:#}")),
            }
            slot.ready.notify_all();
            drop(state);
            result?
        } else {
            let mut state = slot.state.lock().unwrap();
            while matches!(*state, SlotState::Pending) {
                state = slot.ready.wait(state).unwrap();
            }
            match &*state {
                SlotState::Done(path) => path.clone(),
                SlotState::Failed(reason) => {
                    return Err(DownloadFailed {
                        url: url.to_string(),
                        attempts: RETRY_DELAYS.len() as u32,
                        reason: reason.clone(),
                    }
                    .into());
                }
                SlotState::Pending => unreachable!(),
            }
        };

        token.check()?;
        fsutil::link_or_copy(&cached, dest)
            .with_context(|| format!("failed to deliver {} to {}", url, dest.display()))?;
        Ok(())
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        self.cache_dir.join(hex::encode(digest))
    }

    fn download_with_retry(&self, token: &CancelToken, url: &str) -> Result<PathBuf> {
        let target = self.cache_path(url);
        let mut last_error = String::new();

        for attempt in 0..RETRY_DELAYS.len() {
            token.check()?;
            if attempt > 0 {
                std::thread::sleep(Duration::from_secs(RETRY_DELAYS[attempt - 1]));
                token.check()?;
            }
            match self.try_download(url, &target) {
                Ok(()) => return Ok(target),
                Err(e) => last_error = format!("{e:#}"),
            }
        }

        Err(DownloadFailed {
            url: url.to_string(),
            attempts: RETRY_DELAYS.len() as u32,
            reason: last_error,
        }
        .into())
    }

    fn try_download(&self, url: &str, target: &Path) -> Result<()> {
        let mut response = self.client.get(url).send()?.error_for_status()?;
        let partial = target.with_extension("part");
        let mut file = fs::File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("failed to read body of {url}"))?;
        fs::rename(&partial, target)
            .with_context(|| format!("failed to finalize {}", target.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_per_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = Downloader::new(dir.path().join("cache")).expect("new");
        let a = dl.cache_path("https://example.org/a.tar.gz");
        let b = dl.cache_path("https://example.org/b.tar.gz");
        assert_ne!(a, b);
        assert_eq!(a, dl.cache_path("https://example.org/a.tar.gz"));
        assert_eq!(a.parent().unwrap(), dir.path().join("cache"));
    }

    #[test]
    fn fetch_respects_cancellation_before_any_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = Downloader::new(dir.path().join("cache")).expect("new");
        let token = CancelToken::new();
        token.request_cancel();
        let err = dl
            .fetch(&token, "https://example.invalid/x", &dir.path().join("x"))
            .expect_err("must fail");
        assert!(crate::errors::is_cancelled(&err));
    }

    #[test]
    fn exhausted_retries_surface_download_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = Downloader::new(dir.path().join("cache")).expect("new");
        // Refused connections fail fast; keep the retry sleeps short by
        // running against an unroutable localhost port.
        let token = CancelToken::new();
        let err = dl
            .fetch(
                &token,
                "http://127.0.0.1:1/never",
                &dir.path().join("never"),
            )
            .expect_err("must fail");
        assert!(err.chain().any(|c| c.downcast_ref::<DownloadFailed>().is_some()));
    }
}
