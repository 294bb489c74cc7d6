//! The external page archiver: snapshots a URL into a static directory.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

pub const DEFAULT_ARCHIVER: &str =
    "node-site-downloader download -s {url} -d {url} -v --include-images -o {dest}";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archiver command is empty")]
    EmptyCommand,

    #[error("Failed to start archiver '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Archiver exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("Archiver timed out after {0:?}")]
    Timeout(Duration),
}

/// Something that can snapshot `url` into the directory `dest`.
#[async_trait]
pub trait PageArchiver: Send + Sync {
    async fn archive(&self, url: &str, dest: &Path) -> Result<(), ArchiveError>;
}

/// Runs an archiver program built from a whitespace-separated template in
/// which `{url}` and `{dest}` are substituted. No shell is involved.
#[derive(Debug, Clone)]
pub struct CommandArchiver {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandArchiver {
    pub fn from_template(template: &str, timeout: Duration) -> Result<Self, ArchiveError> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ArchiveError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    fn render_args(&self, url: &str, dest: &Path) -> Vec<String> {
        let dest = dest.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{url}", url).replace("{dest}", &dest))
            .collect()
    }
}

#[async_trait]
impl PageArchiver for CommandArchiver {
    async fn archive(&self, url: &str, dest: &Path) -> Result<(), ArchiveError> {
        let args = self.render_args(url, dest);
        tracing::info!(program = %self.program, %url, dest = %dest.display(), "Archiving page");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ArchiveError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ArchiveError::Timeout(self.timeout))?
            .map_err(|source| ArchiveError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        tracing::debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Archiver output"
        );
        if !output.status.success() {
            return Err(ArchiveError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_url_and_dest() {
        let a = CommandArchiver::from_template(DEFAULT_ARCHIVER, Duration::from_secs(1)).unwrap();
        assert_eq!(a.program, "node-site-downloader");
        let args = a.render_args("https://x/y", Path::new("/tmp/stage/site"));
        assert_eq!(
            args,
            vec![
                "download",
                "-s",
                "https://x/y",
                "-d",
                "https://x/y",
                "-v",
                "--include-images",
                "-o",
                "/tmp/stage/site"
            ]
        );
    }

    #[test]
    fn empty_template_is_rejected() {
        assert!(matches!(
            CommandArchiver::from_template("   ", Duration::from_secs(1)),
            Err(ArchiveError::EmptyCommand)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("site");
        let a = CommandArchiver::from_template("mkdir -p {dest}", Duration::from_secs(5)).unwrap();
        a.archive("http://unused", &dest).await.unwrap();
        assert!(dest.is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_exit() {
        let a = CommandArchiver::from_template("false", Duration::from_secs(5)).unwrap();
        let err = a.archive("http://x", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Exit { .. }));
    }

    #[tokio::test]
    async fn missing_program_reports_spawn_error() {
        let a = CommandArchiver::from_template(
            "definitely-not-an-archiver-binary {dest}",
            Duration::from_secs(5),
        )
        .unwrap();
        let err = a.archive("http://x", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let a = CommandArchiver::from_template("sleep 5", Duration::from_millis(100)).unwrap();
        let err = a.archive("http://x", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Timeout(_)));
    }
}
