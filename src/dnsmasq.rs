use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    host::Host,
    model::DomainMapping,
    runner::DomainSync,
    utils::run_captured,
};

/// Conventional dnsmasq config locations, in probe order.
pub const CONFIG_CANDIDATES: [&str; 3] = [
    "/opt/homebrew/etc/dnsmasq.conf",
    "/usr/local/etc/dnsmasq.conf",
    "/etc/dnsmasq.conf",
];

/// Reload mechanisms, tried in order until one succeeds.
const RELOAD_COMMANDS: [(&str, &[&str]); 4] = [
    ("brew", &["services", "restart", "dnsmasq"]),
    ("systemctl", &["restart", "dnsmasq"]),
    ("pkill", &["-HUP", "dnsmasq"]),
    ("killall", &["-HUP", "dnsmasq"]),
];

/// Keeps `address=/<domain>/<ip>` entries of a dnsmasq config in sync.
pub struct Synchronizer<'a> {
    host: &'a dyn Host,
    config_path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(host: &'a dyn Host, config_path: Option<PathBuf>) -> Self {
        Self {
            host,
            config_path,
            candidates: CONFIG_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }

    #[cfg(test)]
    fn with_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
        self.candidates = candidates;
        self
    }

    /// The configured path, else the first existing candidate, else the
    /// first candidate.
    pub fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config_path {
            return path.clone();
        }
        self.candidates
            .iter()
            .find(|p| p.exists())
            .or_else(|| self.candidates.first())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(CONFIG_CANDIDATES[0]))
    }

    /// Maps `domain` to `ip` and reloads dnsmasq. Returns the updated path.
    ///
    /// `ReloadUnavailable` means the file was written but dnsmasq may still
    /// serve the old address.
    pub async fn ensure_domain_ip(&self, domain: &str, ip: &str) -> Result<PathBuf, AppError> {
        let mapping = DomainMapping::new(domain, ip).map_err(AppError::InvalidArgument)?;

        if !self.host.is_installed("dnsmasq") {
            return Err(AppError::unavailable("dnsmasq", "not found in PATH"));
        }

        let path = self.config_path();
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(AppError::io("failed to read dnsmasq config", &path, e)),
        };

        let updated = apply_mapping(&content, &mapping);
        {
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_atomically(&target, &updated))
                .await
                .map_err(|e| {
                    AppError::io("failed to write dnsmasq config", &path, io::Error::other(e))
                })??;
        }
        info!(path = %path.display(), domain, ip, "dnsmasq config updated");

        self.reload(&path).await?;
        Ok(path)
    }

    async fn reload(&self, path: &Path) -> Result<(), AppError> {
        let mut attempts = Vec::new();

        for (tool, args) in RELOAD_COMMANDS {
            let Some(program) = self.host.resolve(tool) else {
                debug!("{tool} not available for dnsmasq reload");
                continue;
            };
            match run_captured(&program, args).await {
                Ok(_) => {
                    info!("dnsmasq reloaded via {tool}");
                    return Ok(());
                }
                Err(e) => {
                    warn!("dnsmasq reload via {tool} failed: {e}");
                    attempts.push(e.to_string());
                }
            }
        }

        let reason = if attempts.is_empty() {
            "no reload command available".to_string()
        } else {
            attempts.join("; ")
        };
        Err(AppError::ReloadUnavailable {
            path: path.to_path_buf(),
            reason,
        })
    }
}

#[async_trait]
impl DomainSync for Synchronizer<'_> {
    async fn ensure_domain_ip(&self, domain: &str, ip: &str) -> Result<PathBuf, AppError> {
        Synchronizer::ensure_domain_ip(self, domain, ip).await
    }
}

/// Replaces the first active line for the mapping's domain, or appends one.
/// Comment lines are never touched and other lines are kept byte for byte,
/// whatever their encoding.
fn apply_mapping(content: &[u8], mapping: &DomainMapping) -> Vec<u8> {
    let prefix = mapping.prefix();
    let line = mapping.line();

    let body = content.strip_suffix(b"\n").unwrap_or(content);
    let mut lines: Vec<&[u8]> = if body.is_empty() {
        vec![]
    } else {
        body.split(|&b| b == b'\n')
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .collect()
    };
    let existing = lines.iter().position(|l| {
        let l = l.trim_ascii();
        !l.starts_with(b"#") && l.starts_with(prefix.as_bytes())
    });
    match existing {
        Some(i) => lines[i] = line.as_bytes(),
        None => lines.push(line.as_bytes()),
    }

    let mut out = lines.join(&b'\n');
    out.push(b'\n');
    out
}

/// Writes `contents` next to `path` and renames it into place, so readers
/// see either the old or the new file.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), AppError> {
    let staged = stage(path, contents)?;
    commit(staged, path)
}

fn stage(path: &Path, contents: &[u8]) -> Result<NamedTempFile, AppError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| AppError::io("failed to create dnsmasq config dir", dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix("dnsmasq.conf.tmp.")
        .tempfile_in(dir)
        .map_err(|e| AppError::io("failed to create temp file in", dir, e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| AppError::io("failed to write temp config", tmp.path(), e))?;

    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), metadata.permissions())
            .map_err(|e| AppError::io("failed to copy permissions to", tmp.path(), e))?;
    }
    Ok(tmp)
}

fn commit(staged: NamedTempFile, path: &Path) -> Result<(), AppError> {
    // on failure the temp file is removed when the error's file handle drops
    staged
        .persist(path)
        .map_err(|e| AppError::io("failed to move temp config into place at", path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SystemHost, testing::FakeHost};

    fn mapping(domain: &str, ip: &str) -> DomainMapping {
        DomainMapping::new(domain, ip).unwrap()
    }

    fn apply(content: &str, mapping: &DomainMapping) -> String {
        String::from_utf8(apply_mapping(content.as_bytes(), mapping)).unwrap()
    }

    fn dnsmasq_host() -> FakeHost {
        FakeHost::default().with_tool("dnsmasq", "/usr/sbin/dnsmasq")
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn appends_to_empty_config() {
        assert_eq!(
            apply("", &mapping("a.local", "1.1.1.1")),
            "address=/a.local/1.1.1.1\n"
        );
    }

    #[test]
    fn replaces_in_place_preserving_other_lines() {
        let content = "port=53\naddress=/a.local/1.1.1.1\naddress=/b.local/5.5.5.5\n";
        assert_eq!(
            apply(content, &mapping("a.local", "2.2.2.2")),
            "port=53\naddress=/a.local/2.2.2.2\naddress=/b.local/5.5.5.5\n"
        );
    }

    #[test]
    fn comment_lines_are_not_matched() {
        let content = "#address=/a.local/9.9.9.9\n";
        assert_eq!(
            apply(content, &mapping("a.local", "3.3.3.3")),
            "#address=/a.local/9.9.9.9\naddress=/a.local/3.3.3.3\n"
        );
    }

    #[test]
    fn only_first_stale_entry_is_replaced() {
        let content = "address=/a.local/1.1.1.1\naddress=/a.local/7.7.7.7\n";
        assert_eq!(
            apply(content, &mapping("a.local", "2.2.2.2")),
            "address=/a.local/2.2.2.2\naddress=/a.local/7.7.7.7\n"
        );
    }

    #[test]
    fn indented_entry_is_matched_and_longer_domain_is_not() {
        let content = "address=/a.local.example/4.4.4.4\n  address=/a.local/1.1.1.1\n";
        assert_eq!(
            apply(content, &mapping("a.local", "2.2.2.2")),
            "address=/a.local.example/4.4.4.4\naddress=/a.local/2.2.2.2\n"
        );
    }

    #[test]
    fn crlf_line_endings_are_normalized() {
        let content = "port=53\r\naddress=/a.local/1.1.1.1\r\n";
        assert_eq!(
            apply(content, &mapping("a.local", "2.2.2.2")),
            "port=53\naddress=/a.local/2.2.2.2\n"
        );
    }

    #[test]
    fn non_utf8_lines_survive_unchanged() {
        let content = b"# caf\xe9 resolver\nport=53\naddress=/a.local/1.1.1.1\n";
        assert_eq!(
            apply_mapping(content, &mapping("a.local", "2.2.2.2")),
            b"# caf\xe9 resolver\nport=53\naddress=/a.local/2.2.2.2\n".to_vec()
        );
    }

    #[test]
    fn aborted_write_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        fs::write(&path, "address=/a.local/1.1.1.1\n").unwrap();

        let staged = stage(&path, b"address=/a.local/2.2.2.2\n").unwrap();
        assert_eq!(files_in(dir.path()).len(), 2);
        drop(staged);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "address=/a.local/1.1.1.1\n"
        );
        assert_eq!(files_in(dir.path()), vec!["dnsmasq.conf"]);
    }

    #[test]
    fn committed_write_replaces_file_and_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        fs::write(&path, "old\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_atomically(&path, b"new\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o644);
        assert_eq!(files_in(dir.path()), vec!["dnsmasq.conf"]);
    }

    #[test]
    fn config_path_probes_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("homebrew.conf");
        let second = dir.path().join("etc.conf");
        let host = FakeHost::default();

        let sync = Synchronizer::new(&host, None)
            .with_candidates(vec![first.clone(), second.clone()]);
        assert_eq!(sync.config_path(), first);

        fs::write(&second, "").unwrap();
        assert_eq!(sync.config_path(), second);

        let explicit = dir.path().join("custom.conf");
        let sync = Synchronizer::new(&host, Some(explicit.clone()));
        assert_eq!(sync.config_path(), explicit);
    }

    #[tokio::test]
    async fn rejects_empty_arguments() {
        let host = dnsmasq_host();
        let sync = Synchronizer::new(&host, Some(PathBuf::from("/nonexistent/dnsmasq.conf")));

        for (domain, ip) in [("", "1.1.1.1"), ("a.local", "")] {
            let err = sync.ensure_domain_ip(domain, ip).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn requires_dnsmasq_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        let host = FakeHost::default();

        let err = Synchronizer::new(&host, Some(path.clone()))
            .ensure_domain_ip("a.local", "1.1.1.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unavailable { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn writes_config_even_when_reload_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("dnsmasq.conf");
        let host = dnsmasq_host();
        let sync = Synchronizer::new(&host, Some(path.clone()));

        let err = sync.ensure_domain_ip("a.local", "1.1.1.1").await.unwrap_err();
        match err {
            AppError::ReloadUnavailable { path: updated, reason } => {
                assert_eq!(updated, path);
                assert_eq!(reason, "no reload command available");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "address=/a.local/1.1.1.1\n");
    }

    #[tokio::test]
    async fn repeated_sync_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        fs::write(&path, "# local dev\nport=53\n").unwrap();
        let host = dnsmasq_host();
        let sync = Synchronizer::new(&host, Some(path.clone()));

        let err = sync
            .ensure_domain_ip("k8s-bench.local", "172.18.0.3")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ReloadUnavailable { .. }));
        let first = fs::read(&path).unwrap();
        let err = sync
            .ensure_domain_ip("k8s-bench.local", "172.18.0.3")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ReloadUnavailable { .. }));
        let second = fs::read(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            String::from_utf8(second).unwrap(),
            "# local dev\nport=53\naddress=/k8s-bench.local/172.18.0.3\n"
        );
    }

    #[tokio::test]
    async fn syncs_config_with_latin1_comment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        fs::write(&path, b"# caf\xe9 resolver\nport=53\n").unwrap();
        let host = dnsmasq_host();

        let err = Synchronizer::new(&host, Some(path.clone()))
            .ensure_domain_ip("a.local", "1.1.1.1")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ReloadUnavailable { .. }));
        assert_eq!(
            fs::read(&path).unwrap(),
            b"# caf\xe9 resolver\nport=53\naddress=/a.local/1.1.1.1\n".to_vec()
        );
    }

    #[tokio::test]
    async fn failed_reload_falls_through_to_next_mechanism() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        let truth = SystemHost.resolve("true").expect("`true` in PATH");
        let falsehood = SystemHost.resolve("false").expect("`false` in PATH");
        let host = dnsmasq_host()
            .with_tool("brew", falsehood)
            .with_tool("pkill", truth);

        let updated = Synchronizer::new(&host, Some(path.clone()))
            .ensure_domain_ip("a.local", "1.1.1.1")
            .await
            .unwrap();
        assert_eq!(updated, path);
    }

    #[tokio::test]
    async fn failed_reloads_are_listed_in_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq.conf");
        let falsehood = SystemHost.resolve("false").expect("`false` in PATH");
        let host = dnsmasq_host().with_tool("killall", falsehood);

        let err = Synchronizer::new(&host, Some(path))
            .ensure_domain_ip("a.local", "1.1.1.1")
            .await
            .unwrap_err();
        match err {
            AppError::ReloadUnavailable { reason, .. } => {
                assert!(reason.contains("false -HUP dnsmasq"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
