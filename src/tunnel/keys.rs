use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::process::run_and_wait;
use crate::error::AppResult;

/// A per-session ssh key pair on local disk
#[derive(Debug, Clone)]
pub struct SshKeyPair {
    pub private_key: PathBuf,
    pub public_key: String,
}

impl SshKeyPair {
    /// Generate a fresh key pair at `<dir>/<name>` (and `.pub`)
    pub async fn generate(dir: &Path, name: &str) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let private_key = dir.join(name);
        remove_files(&private_key);

        run_and_wait(
            "ssh-keygen",
            Command::new("ssh-keygen")
                .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-C", "kubebridge", "-f"])
                .arg(&private_key),
        )
        .await?;

        let public_key = std::fs::read_to_string(public_path(&private_key))?
            .trim()
            .to_string();
        debug!(path = %private_key.display(), "Generated ssh key pair");
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn remove(&self) {
        remove_files(&self.private_key);
    }
}

fn public_path(private_key: &Path) -> PathBuf {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

fn remove_files(private_key: &Path) {
    let _ = std::fs::remove_file(private_key);
    let _ = std::fs::remove_file(public_path(private_key));
}
