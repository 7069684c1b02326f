//! Local resolver redirection
//!
//! While a session is up, cluster names resolve through the shadow pod. The
//! changes are marked so a later clean pass can undo them without knowing
//! what the session wrote.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::stage::Stage;
use crate::error::AppResult;

const BLOCK_BEGIN: &str = "# kubebridge begin";
const BLOCK_END: &str = "# kubebridge end";
const DISABLED_PREFIX: &str = "#kb# ";
/// Suffix on /etc/hosts entries written by the tool
pub const HOSTS_MARKER: &str = "# kubebridge";

pub trait NameServer: Send + Sync {
    fn set_name_server(&self, ip: &str, namespace: &str) -> AppResult<()>;

    fn restore_name_server(&self) -> AppResult<()>;

    fn drop_hosts(&self) -> AppResult<()>;
}

/// `NameServer` backed by resolv.conf and hosts files
pub struct ResolvConf {
    resolv_path: PathBuf,
    hosts_path: PathBuf,
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self::new("/etc/resolv.conf", "/etc/hosts")
    }
}

impl ResolvConf {
    pub fn new(resolv_path: impl AsRef<Path>, hosts_path: impl AsRef<Path>) -> Self {
        Self {
            resolv_path: resolv_path.as_ref().to_path_buf(),
            hosts_path: hosts_path.as_ref().to_path_buf(),
        }
    }

    fn read(path: &Path) -> AppResult<String> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(path: &Path, lines: &[String]) -> AppResult<()> {
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Lines of `content` with our block removed and disabled lines re-enabled
fn restored_lines(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut in_block = false;
    for line in content.lines() {
        if line == BLOCK_BEGIN {
            in_block = true;
        } else if line == BLOCK_END {
            in_block = false;
        } else if !in_block {
            lines.push(line.strip_prefix(DISABLED_PREFIX).unwrap_or(line).to_string());
        }
    }
    lines
}

impl NameServer for ResolvConf {
    fn set_name_server(&self, ip: &str, namespace: &str) -> AppResult<()> {
        let content = Self::read(&self.resolv_path)?;
        let mut lines = vec![
            BLOCK_BEGIN.to_string(),
            format!("nameserver {}", ip),
            format!(
                "search {}.svc.cluster.local svc.cluster.local cluster.local",
                namespace
            ),
            BLOCK_END.to_string(),
        ];
        for line in restored_lines(&content) {
            let key = line.split_whitespace().next().unwrap_or("");
            if matches!(key, "nameserver" | "search" | "domain") {
                lines.push(format!("{}{}", DISABLED_PREFIX, line));
            } else {
                lines.push(line);
            }
        }
        Self::write(&self.resolv_path, &lines)?;
        info!(ip, path = %self.resolv_path.display(), "Name server redirected");
        Ok(())
    }

    fn restore_name_server(&self) -> AppResult<()> {
        let content = Self::read(&self.resolv_path)?;
        if !content.contains(BLOCK_BEGIN) && !content.contains(DISABLED_PREFIX) {
            debug!("Name server untouched, nothing to restore");
            return Ok(());
        }
        Self::write(&self.resolv_path, &restored_lines(&content))?;
        info!(path = %self.resolv_path.display(), "Name server restored");
        Ok(())
    }

    fn drop_hosts(&self) -> AppResult<()> {
        let content = Self::read(&self.hosts_path)?;
        let kept: Vec<String> = content
            .lines()
            .filter(|l| !l.trim_end().ends_with(HOSTS_MARKER))
            .map(str::to_string)
            .collect();
        if kept.len() == content.lines().count() {
            return Ok(());
        }
        Self::write(&self.hosts_path, &kept)?;
        info!(path = %self.hosts_path.display(), "Dropped hosts entries");
        Ok(())
    }
}

pub struct DnsStage {
    name_server: Arc<dyn NameServer>,
    ip: String,
    namespace: String,
    applied: bool,
}

impl DnsStage {
    pub fn new(name_server: Arc<dyn NameServer>, ip: &str, namespace: &str) -> Self {
        Self {
            name_server,
            ip: ip.to_string(),
            namespace: namespace.to_string(),
            applied: false,
        }
    }
}

#[async_trait]
impl Stage for DnsStage {
    fn name(&self) -> &str {
        "dns"
    }

    async fn start(&mut self) -> AppResult<()> {
        self.name_server.set_name_server(&self.ip, &self.namespace)?;
        self.applied = true;
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        if std::mem::take(&mut self.applied) {
            self.name_server.restore_name_server()?;
            self.name_server.drop_hosts()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ORIGINAL: &str = "# generated\nnameserver 8.8.8.8\nsearch example.com\n";

    fn setup() -> (TempDir, ResolvConf) {
        let dir = TempDir::new().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let hosts = dir.path().join("hosts");
        std::fs::write(&resolv, ORIGINAL).unwrap();
        std::fs::write(
            &hosts,
            "127.0.0.1 localhost\n10.96.0.5 api.dev # kubebridge\n",
        )
        .unwrap();
        let conf = ResolvConf::new(&resolv, &hosts);
        (dir, conf)
    }

    #[test]
    fn test_set_and_restore() {
        let (dir, conf) = setup();
        conf.set_name_server("10.244.1.9", "dev").unwrap();

        let written = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        let first_server = written
            .lines()
            .find(|l| l.starts_with("nameserver"))
            .unwrap();
        assert_eq!(first_server, "nameserver 10.244.1.9");
        assert!(written.contains("#kb# nameserver 8.8.8.8"));
        assert!(written.contains("#kb# search example.com"));
        assert!(written.contains("search dev.svc.cluster.local"));

        conf.restore_name_server().unwrap();
        let restored = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(restored, ORIGINAL);
    }

    #[test]
    fn test_set_twice_keeps_one_block() {
        let (dir, conf) = setup();
        conf.set_name_server("10.244.1.9", "dev").unwrap();
        conf.set_name_server("10.244.2.3", "dev").unwrap();
        let written = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(written.matches(BLOCK_BEGIN).count(), 1);
        assert!(!written.contains("10.244.1.9"));
        assert!(!written.contains("#kb# #kb#"));
    }

    #[test]
    fn test_restore_untouched_is_noop() {
        let (dir, conf) = setup();
        conf.restore_name_server().unwrap();
        let content = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(content, ORIGINAL);
    }

    #[test]
    fn test_drop_hosts() {
        let (dir, conf) = setup();
        conf.drop_hosts().unwrap();
        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert_eq!(hosts, "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn test_stage_restores_on_stop() {
        let (dir, conf) = setup();
        let mut stage = DnsStage::new(Arc::new(conf), "10.244.1.9", "dev");
        stage.start().await.unwrap();
        stage.stop().await.unwrap();
        stage.stop().await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("resolv.conf")).unwrap();
        assert_eq!(content, ORIGINAL);
    }
}
