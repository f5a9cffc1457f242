//! Isolated GPG signing environment.
//!
//! Each distribution configuration gets its own throwaway GPG home with
//! the configured private key imported into it, plus a wrapper script that
//! pins the batch/loopback/homedir/passphrase flags so external signers
//! (debsign, rpmsign, aptly) can be pointed at a plain `gpg` program path.
//! The home directory is removed when the context is dropped.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use repomason_process::{CancelToken, run_quiet, run_stdout};

use crate::config::GpgConfig;
use crate::errors::ConfigError;

pub struct GpgContext {
    home: TempDir,
    key_id: String,
    uid: String,
    passphrase: String,
    wrapper: PathBuf,
}

impl GpgContext {
    /// Import `cfg.file` into a fresh 0700 home directory and select the
    /// signing key and uid.
    pub fn new(token: &CancelToken, cfg: &GpgConfig, passphrase: &str) -> Result<Self> {
        let home = tempfile::Builder::new()
            .prefix("repomason-gpg.")
            .tempdir()
            .context("failed to create gpg home")?;
        fs::set_permissions(home.path(), fs::Permissions::from_mode(0o700))?;
        let home_arg = home.path().display().to_string();

        let import = vec![
            "gpg".to_string(),
            "--homedir".to_string(),
            home_arg.clone(),
            "--batch".to_string(),
            "--pinentry-mode".to_string(),
            "loopback".to_string(),
            "--passphrase".to_string(),
            passphrase.to_string(),
            "--import".to_string(),
            cfg.file.display().to_string(),
        ];
        run_quiet(token, &import, None)
            .with_context(|| format!("failed to import gpg key {}", cfg.file.display()))?;

        let list = vec![
            "gpg".to_string(),
            "--homedir".to_string(),
            home_arg.clone(),
            "--batch".to_string(),
            "--with-colons".to_string(),
            "--fingerprint".to_string(),
            "--list-secret-keys".to_string(),
        ];
        let listing = run_stdout(token, &list, None).context("failed to list secret keys")?;
        let (key_id, uid) = select_key(&listing, cfg.id.as_deref(), cfg.uid.as_deref())?;

        let wrapper = home.path().join("gpg-wrapper.sh");
        fs::write(
            &wrapper,
            format!(
                "#!/bin/sh\nexec gpg --batch --pinentry-mode loopback --homedir {} --passphrase {} \"$@\"\n",
                sh_quote(&home_arg),
                sh_quote(passphrase),
            ),
        )?;
        fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o700))?;

        Ok(Self {
            home,
            key_id,
            uid,
            passphrase: passphrase.to_string(),
            wrapper,
        })
    }

    /// Full fingerprint, uppercase.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Last 8 hex digits of the fingerprint, as expected by aptly.
    pub fn short_key_id(&self) -> &str {
        &self.key_id[self.key_id.len().saturating_sub(8)..]
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    /// The public keyring inside the home directory.
    pub fn keyring(&self) -> PathBuf {
        self.home.path().join("pubring.kbx")
    }

    pub fn wrapper(&self) -> &Path {
        &self.wrapper
    }

    // Argv-splicing accessors. External signers disagree on how they want
    // the same value handed over: glued onto a flag (`-k<id>`,
    // `_gpg_name <id>`), as its own argument after one (`--local-user
    // <id>`), or with trailing text/arguments. Each context value comes in
    // all four shapes so call sites never reassemble fragments by hand.

    /// `<prefix><full-key-id>` (`-k<id>`, `_gpg_name <id>`).
    pub fn key_id_arg(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.key_id)
    }

    /// `<full-key-id><suffix>`.
    pub fn key_id_suffixed(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.key_id)
    }

    /// `[flags..., <full-key-id>]` (`--local-user <id>`).
    pub fn key_id_args(&self, flags: &[&str]) -> Vec<String> {
        splice_arg(&self.key_id, flags, &[])
    }

    /// `[<full-key-id>, trailing...]`.
    pub fn key_id_args_suffixed(&self, trailing: &[&str]) -> Vec<String> {
        splice_arg(&self.key_id, &[], trailing)
    }

    /// `<prefix><last-8-digits>`, the shape aptly takes (`-gpg-key=<id>`).
    pub fn short_key_id_arg(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.short_key_id())
    }

    /// `<prefix><passphrase>` (`-passphrase=<p>`).
    pub fn passphrase_arg(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.passphrase)
    }

    /// `<prefix><wrapper-path>`, for callees that take a gpg program flag.
    pub fn wrapper_arg(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.wrapper.display())
    }

    /// `[flags..., <wrapper-path>]`.
    pub fn wrapper_args(&self, flags: &[&str]) -> Vec<String> {
        splice_arg(&self.wrapper.display().to_string(), flags, &[])
    }

    /// Export the armored public key to `dest`.
    pub fn export_public_key(&self, token: &CancelToken, dest: &Path) -> Result<()> {
        let argv = vec![
            "gpg".to_string(),
            "--homedir".to_string(),
            self.home.path().display().to_string(),
            "--batch".to_string(),
            "--yes".to_string(),
            "--armor".to_string(),
            "--output".to_string(),
            dest.display().to_string(),
            "--export".to_string(),
            self.key_id.clone(),
        ];
        run_quiet(token, &argv, None)
            .with_context(|| format!("failed to export public key to {}", dest.display()))?;
        Ok(())
    }
}

/// Pick the signing key and uid from a `--with-colons` secret-key listing.
///
/// `want_id` matches the last 8 hex digits of the fingerprint,
/// case-insensitively; without it the first `sec` record wins. `uid_hint`
/// selects the first uid containing it; without it the key's first uid wins.
fn select_key(
    listing: &str,
    want_id: Option<&str>,
    uid_hint: Option<&str>,
) -> Result<(String, String), ConfigError> {
    struct Key {
        fingerprint: Option<String>,
        uids: Vec<String>,
    }

    let mut keys: Vec<Key> = Vec::new();
    for line in listing.lines() {
        let mut fields = line.split(':');
        let record = fields.next().unwrap_or_default();
        match record {
            "sec" => keys.push(Key {
                fingerprint: None,
                uids: Vec::new(),
            }),
            "fpr" => {
                if let Some(key) = keys.last_mut() {
                    if key.fingerprint.is_none() {
                        if let Some(fpr) = line.split(':').nth(9) {
                            key.fingerprint = Some(fpr.to_ascii_uppercase());
                        }
                    }
                }
            }
            "uid" => {
                if let Some(key) = keys.last_mut() {
                    if let Some(uid) = line.split(':').nth(9) {
                        key.uids.push(uid.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let selected = match want_id {
        Some(id) => {
            let id = id.to_ascii_uppercase();
            keys.iter()
                .find(|k| {
                    k.fingerprint
                        .as_deref()
                        .is_some_and(|f| f.ends_with(&id))
                })
                .ok_or_else(|| ConfigError(format!("no secret key matches id {id}")))?
        }
        None => keys
            .iter()
            .find(|k| k.fingerprint.is_some())
            .ok_or_else(|| ConfigError("no secret key in keyring".to_string()))?,
    };

    let fingerprint = selected
        .fingerprint
        .clone()
        .ok_or_else(|| ConfigError("secret key has no fingerprint record".to_string()))?;
    let uid = match uid_hint {
        Some(hint) => selected
            .uids
            .iter()
            .find(|u| u.contains(hint))
            .ok_or_else(|| ConfigError(format!("no uid matches {hint}")))?
            .clone(),
        None => selected
            .uids
            .first()
            .ok_or_else(|| ConfigError("secret key has no uid record".to_string()))?
            .clone(),
    };

    Ok((fingerprint, uid))
}

/// Surround `value` with whole arguments: `[before..., value, after...]`.
fn splice_arg(value: &str, before: &[&str], after: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = before.iter().map(|s| s.to_string()).collect();
    out.push(value.to_string());
    out.extend(after.iter().map(|s| s.to_string()));
    out
}

/// Single-quote a string for inclusion in the wrapper script.
fn sh_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
sec:u:4096:1:1111222233334444:1600000000:::u:::scESC:::+:::23::0:
fpr:::::::::AAAABBBBCCCCDDDDEEEEFFFF1111222233334444:
grp:::::::::0123456789ABCDEF0123456789ABCDEF01234567:
uid:u::::1600000000::HASH::PDI Team <pdi@example.org>::::::::::0:
uid:u::::1600000001::HASH::PDI CI <ci@example.org>::::::::::0:
sec:u:255:22:9999888877776666:1650000000:::u:::scESC:::+:::ed25519::0:
fpr:::::::::00001111222233334444555566667777AABBCCDD:
uid:u::::1650000000::HASH::Other Key <other@example.org>::::::::::0:
";

    #[test]
    fn first_sec_record_wins_without_id() {
        let (fpr, uid) = select_key(LISTING, None, None).expect("select");
        assert_eq!(fpr, "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444");
        assert_eq!(uid, "PDI Team <pdi@example.org>");
    }

    #[test]
    fn id_matches_last_eight_digits_case_insensitively() {
        let (fpr, uid) = select_key(LISTING, Some("aabbccdd"), None).expect("select");
        assert_eq!(fpr, "00001111222233334444555566667777AABBCCDD");
        assert_eq!(uid, "Other Key <other@example.org>");

        let (fpr, _) = select_key(LISTING, Some("33334444"), None).expect("select");
        assert_eq!(fpr, "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444");
    }

    #[test]
    fn uid_hint_selects_matching_uid() {
        let (_, uid) = select_key(LISTING, None, Some("CI")).expect("select");
        assert_eq!(uid, "PDI CI <ci@example.org>");
    }

    #[test]
    fn unmatched_selectors_are_config_errors() {
        assert!(select_key(LISTING, Some("00000000"), None).is_err());
        assert!(select_key(LISTING, None, Some("nobody")).is_err());
        assert!(select_key("", None, None).is_err());
    }

    #[test]
    fn sh_quote_wraps_and_escapes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    fn context() -> GpgContext {
        let home = tempfile::tempdir().expect("tempdir");
        let wrapper = home.path().join("gpg-wrapper.sh");
        GpgContext {
            home,
            key_id: "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444".to_string(),
            uid: "PDI Team <pdi@example.org>".to_string(),
            passphrase: "secret".to_string(),
            wrapper,
        }
    }

    #[test]
    fn accessors_cover_all_four_splice_shapes() {
        let gpg = context();

        // Prefix string / suffix string.
        assert_eq!(
            gpg.key_id_arg("-k"),
            "-kAAAABBBBCCCCDDDDEEEEFFFF1111222233334444"
        );
        assert_eq!(
            gpg.key_id_suffixed("!"),
            "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444!"
        );

        // Prefix list / suffix list.
        assert_eq!(
            gpg.key_id_args(&["--local-user"]),
            vec!["--local-user", "AAAABBBBCCCCDDDDEEEEFFFF1111222233334444"]
        );
        assert_eq!(
            gpg.key_id_args_suffixed(&["--", "extra"]),
            vec!["AAAABBBBCCCCDDDDEEEEFFFF1111222233334444", "--", "extra"]
        );
    }

    #[test]
    fn short_passphrase_and_wrapper_shapes() {
        let gpg = context();
        assert_eq!(gpg.short_key_id_arg("-gpg-key="), "-gpg-key=33334444");
        assert_eq!(gpg.passphrase_arg("-passphrase="), "-passphrase=secret");

        let wrapper = gpg.wrapper().display().to_string();
        assert_eq!(gpg.wrapper_arg("-p"), format!("-p{wrapper}"));
        assert_eq!(gpg.wrapper_args(&["--define"]), vec!["--define".to_string(), wrapper]);
    }

    #[test]
    fn splice_arg_surrounds_the_value() {
        assert_eq!(splice_arg("v", &[], &[]), vec!["v"]);
        assert_eq!(splice_arg("v", &["-a", "-b"], &["-c"]), vec!["-a", "-b", "v", "-c"]);
    }
}
