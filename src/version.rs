//! Installed backend version detection and launch-flag gates

use semver::Version;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// Upper bound for `<command> --version` to answer
const DETECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capabilities of the installed backend that change its command line.
///
/// An unknown version selects the legacy argument set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendVersion(Option<Version>);

impl BackendVersion {
    pub fn known(version: Version) -> Self {
        Self(Some(version))
    }

    pub fn unknown() -> Self {
        Self(None)
    }

    /// Parse the leading `major.minor[.patch]` of a version string.
    ///
    /// Suffixes such as `a0`, `rc1` or `+cpu` are ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        parse_leading_version(raw).map(Self::known)
    }

    pub fn get(&self) -> Option<&Version> {
        self.0.as_ref()
    }

    fn at_least(&self, major: u64, minor: u64) -> bool {
        self.0
            .as_ref()
            .map(|v| *v >= Version::new(major, minor, 0))
            .unwrap_or(false)
    }

    /// `--bind_all` replaced `--host 0.0.0.0` in 2.0
    pub fn supports_bind_all(&self) -> bool {
        self.at_least(2, 0)
    }

    pub fn supports_reload_multifile(&self) -> bool {
        self.at_least(2, 3)
    }

    /// 2.4 moved flags under `serve` and removed the debugger port
    pub fn uses_serve_subcommand(&self) -> bool {
        self.at_least(2, 4)
    }

    pub fn supports_load_fast(&self) -> bool {
        self.at_least(2, 5)
    }
}

impl std::fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "unknown"),
        }
    }
}

/// Find the version in `--version` output.
///
/// A version is accepted when it fills a whole line or follows a
/// `TensorBoard` or `version` word, so addresses printed alongside it are
/// never mistaken for one.
fn parse_leading_version(raw: &str) -> Option<Version> {
    raw.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if let [token] = tokens.as_slice() {
            if let Some(version) = parse_version_token(token) {
                return Some(version);
            }
        }
        tokens.windows(2).find_map(|pair| {
            let label = pair[0].trim_end_matches(':').to_ascii_lowercase();
            if label == "tensorboard" || label == "version" {
                parse_version_token(pair[1])
            } else {
                None
            }
        })
    })
}

/// Parse `[v]major.minor[.patch][suffix]`, with the suffix only after the
/// last numeric part
fn parse_version_token(token: &str) -> Option<Version> {
    let token = token.trim_start_matches('v');
    let parts: Vec<&str> = token.split('.').collect();
    if !(2..=3).contains(&parts.len()) {
        return None;
    }

    let mut numbers = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let end = part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(part.len());
        if end == 0 {
            return None;
        }
        let suffix = &part[end..];
        let last = i == parts.len() - 1;
        if !suffix.is_empty() && (!last || suffix.contains([':', '/'])) {
            return None;
        }
        numbers.push(part[..end].parse::<u64>().ok()?);
    }

    match numbers.as_slice() {
        [major, minor, patch] => Some(Version::new(*major, *minor, *patch)),
        [major, minor] => Some(Version::new(*major, *minor, 0)),
        _ => None,
    }
}

/// Resolve the backend version, preferring the configured override.
///
/// Detection failures are logged and yield an unknown version; the
/// executable may still be runnable.
pub async fn detect(command: &str, configured: Option<&str>) -> BackendVersion {
    if let Some(raw) = configured {
        return match BackendVersion::parse(raw) {
            Some(version) => version,
            None => {
                error!(version = raw, "Configured backend version is not a version number");
                BackendVersion::unknown()
            }
        };
    }

    let output = tokio::time::timeout(
        DETECT_TIMEOUT,
        Command::new(command)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let output = match output {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            error!(command, error = %e, "Failed to detect backend version, check the backend installation");
            return BackendVersion::unknown();
        }
        Err(_) => {
            error!(command, "Timed out detecting backend version");
            return BackendVersion::unknown();
        }
    };

    // Some releases print the version on stderr
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let parsed = BackendVersion::parse(&stdout).or_else(|| BackendVersion::parse(&stderr));

    match parsed {
        Some(version) => {
            debug!(command, %version, "Detected backend version");
            version
        }
        None => {
            error!(
                command,
                stdout = %stdout.trim(),
                stderr = %stderr.trim(),
                "Could not parse backend version"
            );
            BackendVersion::unknown()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str) -> BackendVersion {
        BackendVersion::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_plain_versions() {
        assert_eq!(v("2.15.1").get(), Some(&Version::new(2, 15, 1)));
        assert_eq!(v("1.15").get(), Some(&Version::new(1, 15, 0)));
        assert_eq!(v("v2.4.0").get(), Some(&Version::new(2, 4, 0)));
    }

    #[test]
    fn test_parse_ignores_suffixes() {
        assert_eq!(v("2.10.0a0").get(), Some(&Version::new(2, 10, 0)));
        assert_eq!(v("2.16.2+cpu").get(), Some(&Version::new(2, 16, 2)));
        assert_eq!(v("TensorBoard 2.3.0rc1").get(), Some(&Version::new(2, 3, 0)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BackendVersion::parse("").is_none());
        assert!(BackendVersion::parse("command not found").is_none());
        assert!(BackendVersion::parse("7").is_none());
    }

    #[test]
    fn test_parse_ignores_addresses_and_stray_numbers() {
        assert!(BackendVersion::parse("127.0.0.1:6006").is_none());
        assert!(BackendVersion::parse("Serving on http://127.0.0.1:6006/").is_none());
        assert!(BackendVersion::parse("listening on 0.0.0.0").is_none());
        assert!(BackendVersion::parse("loaded 3.5 MB of plugins").is_none());

        let noisy = "W0101 warning from 1.2.3.4:80\nTensorBoard 2.12.0\n";
        assert_eq!(v(noisy).get(), Some(&Version::new(2, 12, 0)));
        assert_eq!(v("tensorboard version: 2.4").get(), Some(&Version::new(2, 4, 0)));
    }

    #[test]
    fn test_ordering_is_numeric_not_lexicographic() {
        // "2.10.0" < "2.3.0" as strings
        assert!(v("2.10.0").supports_reload_multifile());
        assert!(v("2.10.0").uses_serve_subcommand());
        assert!(v("10.0.0").supports_bind_all());
        assert!(v("2.10.0").get() > v("2.3.0").get());
    }

    #[test]
    fn test_version_gates() {
        let legacy = v("1.15.0");
        assert!(!legacy.supports_bind_all());
        assert!(!legacy.supports_reload_multifile());
        assert!(!legacy.uses_serve_subcommand());
        assert!(!legacy.supports_load_fast());

        let v23 = v("2.3.0");
        assert!(v23.supports_bind_all());
        assert!(v23.supports_reload_multifile());
        assert!(!v23.uses_serve_subcommand());

        let v24 = v("2.4.1");
        assert!(v24.uses_serve_subcommand());
        assert!(!v24.supports_load_fast());

        assert!(v("2.5.0").supports_load_fast());
    }

    #[test]
    fn test_unknown_version_is_legacy() {
        let unknown = BackendVersion::unknown();
        assert!(!unknown.supports_bind_all());
        assert!(!unknown.uses_serve_subcommand());
        assert_eq!(unknown.to_string(), "unknown");
    }

    #[tokio::test]
    async fn test_detect_prefers_configured_version() {
        let version = detect("/nonexistent/backend", Some("2.11.0")).await;
        assert_eq!(version.get(), Some(&Version::new(2, 11, 0)));
    }

    #[tokio::test]
    async fn test_detect_missing_command_is_unknown() {
        let version = detect("/nonexistent/backend", None).await;
        assert_eq!(version, BackendVersion::unknown());
    }
}
