//! Object storage through the `rclone` command line tool.
//!
//! Every operation is one child process. Credentials reach the tool through
//! `RCLONE_CONFIG_<REMOTE>_*` environment variables on that process only, so
//! no rclone configuration file is created or modified.

use crate::config::StorageTarget;
use crate::error::HostError;
use crate::progress::{LineBuffer, ProgressParser};
use crate::remote::{Location, ProgressFn, Remote, StorageSize};
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::TransferProgress;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Name under which the storage target is exposed to the tool.
pub const REMOTE_NAME: &str = "passthehost";

// rclone exit codes
const EXIT_DIRECTORY_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;
const EXIT_TEMPORARY_ERROR: i32 = 5;

pub struct RcloneRemote {
    program: PathBuf,
    leading_args: Vec<OsString>,
    target: StorageTarget,
    transfers: u32,
    stats_interval: Duration,
}

impl RcloneRemote {
    pub fn new(program: impl Into<PathBuf>, target: StorageTarget) -> Self {
        RcloneRemote {
            program: program.into(),
            leading_args: Vec::new(),
            target,
            transfers: crate::config::DEFAULT_TRANSFERS,
            stats_interval: crate::config::DEFAULT_STATS_INTERVAL,
        }
    }

    pub fn with_transfers(mut self, transfers: u32) -> Self {
        self.transfers = transfers.max(1);
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Arguments placed before every subcommand, for running the tool
    /// through a wrapper (`sh script.sh`, `flatpak run ...`).
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rclone".to_string())
    }

    fn environment(&self) -> Vec<(String, String)> {
        let prefix = format!("RCLONE_CONFIG_{}", REMOTE_NAME.to_uppercase());
        let mut env = vec![
            (format!("{}_TYPE", prefix), "s3".to_string()),
            (format!("{}_PROVIDER", prefix), self.target.provider.clone()),
            (format!("{}_ACCESS_KEY_ID", prefix), self.target.access_key.clone()),
            (
                format!("{}_SECRET_ACCESS_KEY", prefix),
                self.target.secret_key.clone(),
            ),
            (format!("{}_ACL", prefix), "private".to_string()),
        ];

        if !self.target.endpoint.is_empty() {
            env.push((format!("{}_ENDPOINT", prefix), self.target.endpoint.clone()));
        }
        if !self.target.region.is_empty() {
            env.push((format!("{}_REGION", prefix), self.target.region.clone()));
        }

        env
    }

    fn remote_path(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        if key.is_empty() {
            format!("{}:{}", REMOTE_NAME, self.target.bucket)
        } else {
            format!("{}:{}/{}", REMOTE_NAME, self.target.bucket, key)
        }
    }

    fn location_arg(&self, location: &Location) -> OsString {
        match location {
            Location::Local(path) => path.clone().into_os_string(),
            Location::Remote(key) => self.remote_path(key).into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .envs(self.environment())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Runs a short command to completion and returns its stdout.
    async fn run(&self, args: &[OsString], subject: &str) -> Result<String, HostError> {
        let mut command = self.command();
        command.args(args);
        debug!("Running {} {:?}", self.tool_name(), args);

        let output = command.output().await.map_err(|e| self.spawn_failure(e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(self.classify_failure(output.status.code(), last_line(&stderr), subject))
        }
    }

    fn spawn_failure(&self, error: std::io::Error) -> HostError {
        HostError::ProcessFailure {
            tool: self.tool_name(),
            code: None,
            message: format!("could not start {}: {}", self.program.display(), error),
        }
    }

    fn classify_failure(&self, code: Option<i32>, message: &str, subject: &str) -> HostError {
        let mentions_missing = message.to_lowercase().contains("not found");

        match code {
            Some(EXIT_DIRECTORY_NOT_FOUND) | Some(EXIT_FILE_NOT_FOUND) => {
                HostError::not_found("object", subject)
            }
            Some(EXIT_TEMPORARY_ERROR) => HostError::Transient(message.to_string()),
            _ if mentions_missing => HostError::not_found("object", subject),
            code => HostError::ProcessFailure {
                tool: self.tool_name(),
                code,
                message: message.to_string(),
            },
        }
    }

    fn progress_line(
        &self,
        parser: &mut ProgressParser,
        diagnostic: &mut String,
        line: &str,
        on_progress: Option<ProgressFn<'_>>,
    ) {
        if let Some(progress) = parser.observe(line) {
            if let Some(callback) = on_progress {
                callback(progress);
            }
        } else if ProgressParser::parse_line(line).is_none() {
            debug!("{}: {}", self.tool_name(), line.trim());
            *diagnostic = line.trim().to_string();
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
}

fn args<const N: usize>(items: [&str; N]) -> Vec<OsString> {
    items.iter().map(OsString::from).collect()
}

#[async_trait]
impl Remote for RcloneRemote {
    async fn cat(&self, key: &str) -> Result<Option<String>, HostError> {
        let path = self.remote_path(key);
        match self.run(&args(["cat", path.as_str()]), key).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn copy_file(&self, local: &Path, key: &str) -> Result<(), HostError> {
        let command = vec![
            OsString::from("copyto"),
            local.as_os_str().to_os_string(),
            self.remote_path(key).into(),
        ];
        self.run(&command, key).await.map(|_| ())
    }

    async fn delete_file(&self, key: &str) -> Result<bool, HostError> {
        let path = self.remote_path(key);

        match self.run(&args(["lsf", path.as_str()]), key).await {
            Ok(listing) if listing.trim().is_empty() => return Ok(false),
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        }

        self.run(&args(["deletefile", path.as_str()]), key).await?;
        Ok(true)
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, HostError> {
        let path = self.remote_path(key);
        let listing = self.run(&args(["lsf", path.as_str()]), key).await?;

        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn list_dirs(&self, key: &str) -> Result<Vec<String>, HostError> {
        let path = self.remote_path(key);
        let listing = self.run(&args(["lsf", path.as_str(), "--dirs-only"]), key).await?;

        Ok(listing
            .lines()
            .map(|line| line.trim().trim_end_matches('/'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn purge(&self, key: &str) -> Result<(), HostError> {
        let path = self.remote_path(key);
        self.run(&args(["purge", path.as_str()]), key).await.map(|_| ())
    }

    async fn size(&self, key: &str) -> Result<StorageSize, HostError> {
        let path = self.remote_path(key);
        let output = self.run(&args(["size", path.as_str(), "--json"]), key).await?;

        serde_json::from_str(output.trim()).map_err(|e| HostError::Malformed {
            what: "size report",
            source: e.into(),
        })
    }

    async fn check_access(&self) -> Result<(), HostError> {
        let bucket = self.remote_path("");
        self.run(&args(["lsd", bucket.as_str()]), &self.target.bucket)
            .await
            .map(|_| ())
    }

    async fn mirror(
        &self,
        from: &Location,
        to: &Location,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<(), HostError> {
        let mut command = self.command();
        command
            .arg("sync")
            .arg(self.location_arg(from))
            .arg(self.location_arg(to))
            .arg("--progress")
            .arg("--stats")
            .arg(format!("{}ms", self.stats_interval.as_millis()))
            .arg("--transfers")
            .arg(self.transfers.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Mirroring {} -> {}", from, to);
        let mut child = command.spawn().map_err(|e| self.spawn_failure(e))?;

        let (mut stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(HostError::ProcessFailure {
                    tool: self.tool_name(),
                    code: None,
                    message: "output streams unavailable".to_string(),
                })
            }
        };

        let mut parser = ProgressParser::new();
        let mut diagnostic = String::new();
        let mut out_lines = LineBuffer::default();
        let mut err_lines = LineBuffer::default();
        let mut out_chunk = [0u8; 4096];
        let mut err_chunk = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            let lines = tokio::select! {
                read = stdout.read(&mut out_chunk), if out_open => match read {
                    Ok(0) | Err(_) => {
                        out_open = false;
                        out_lines.finish().into_iter().collect()
                    }
                    Ok(n) => out_lines.push(&out_chunk[..n]),
                },
                read = stderr.read(&mut err_chunk), if err_open => match read {
                    Ok(0) | Err(_) => {
                        err_open = false;
                        err_lines.finish().into_iter().collect()
                    }
                    Ok(n) => err_lines.push(&err_chunk[..n]),
                },
            };

            for line in lines {
                self.progress_line(&mut parser, &mut diagnostic, &line, on_progress);
            }
        }

        let status = child.wait().await.map_err(|e| HostError::ProcessFailure {
            tool: self.tool_name(),
            code: None,
            message: format!("waiting for sync failed: {}", e),
        })?;
        info!("{} sync exited with {}", self.tool_name(), status);

        if status.success() {
            if let Some(callback) = on_progress {
                callback(TransferProgress::complete());
            }
            Ok(())
        } else {
            if diagnostic.is_empty() {
                diagnostic = "sync failed".to_string();
            }
            warn!("Mirror {} -> {} failed: {}", from, to, diagnostic);
            Err(self.classify_failure(status.code(), &diagnostic, &from.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> StorageTarget {
        StorageTarget {
            provider: "Cloudflare".to_string(),
            endpoint: "https://acct.r2.cloudflarestorage.com".to_string(),
            region: String::new(),
            bucket: "worlds".to_string(),
            access_key: "key".to_string(),
            secret_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_remote_path() {
        let remote = RcloneRemote::new("rclone", target());

        assert_eq!(
            remote.remote_path("pass_the_host/alpha/server.lock"),
            "passthehost:worlds/pass_the_host/alpha/server.lock"
        );
        assert_eq!(remote.remote_path(""), "passthehost:worlds");
    }

    #[test]
    fn test_environment_skips_empty_region() {
        let remote = RcloneRemote::new("rclone", target());
        let env = remote.environment();

        assert!(env.contains(&(
            "RCLONE_CONFIG_PASSTHEHOST_TYPE".to_string(),
            "s3".to_string()
        )));
        assert!(env.contains(&(
            "RCLONE_CONFIG_PASSTHEHOST_SECRET_ACCESS_KEY".to_string(),
            "secret".to_string()
        )));
        assert!(env.iter().all(|(k, _)| k != "RCLONE_CONFIG_PASSTHEHOST_REGION"));
    }

    #[test]
    fn test_failure_classification() {
        let remote = RcloneRemote::new("/opt/rclone/rclone", target());

        assert!(remote
            .classify_failure(Some(3), "directory not found", "k")
            .is_not_found());
        assert!(remote.classify_failure(Some(4), "", "k").is_not_found());
        assert!(remote
            .classify_failure(Some(1), "error: object not found", "k")
            .is_not_found());
        assert!(remote
            .classify_failure(Some(5), "connection reset", "k")
            .is_retryable());
        assert!(remote
            .classify_failure(Some(5), "object not found, retrying", "k")
            .is_retryable());

        match remote.classify_failure(Some(7), "AccessDenied", "k") {
            HostError::ProcessFailure { tool, code, .. } => {
                assert_eq!(tool, "rclone");
                assert_eq!(code, Some(7));
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nb\n\n  "), "b");
        assert_eq!(last_line(""), "no diagnostic output");
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::sync::Mutex;

        /// Runs `script` through `sh` in place of the real tool.
        fn scripted(dir: &Path, script: &str) -> RcloneRemote {
            let path = dir.join("fake-rclone.sh");
            std::fs::write(&path, script).unwrap();
            RcloneRemote::new("sh", target()).with_leading_args([path])
        }

        #[tokio::test]
        async fn test_mirror_reports_deduplicated_progress() {
            let dir = tempfile::tempdir().unwrap();
            let remote = scripted(
                dir.path(),
                r#"
printf 'Transferred:   \t  1 MiB / 4 MiB, 25%%, 1 MiB/s, ETA 3s\r'
printf 'Transferred:   \t  1 MiB / 4 MiB, 25%%, 1 MiB/s, ETA 3s\r'
printf 'Transferred:   \t  2 MiB / 4 MiB, 5'
sleep 0.1
printf '0%%, 1 MiB/s, ETA 2s\n'
printf 'Transferred:            3 / 4, 75%%\n'
echo 'NOTICE: checks finished' >&2
exit 0
"#,
            );

            let events = Mutex::new(Vec::new());
            let record = |p: TransferProgress| events.lock().unwrap().push(p);

            let result = remote
                .mirror(
                    &Location::Remote("pass_the_host/w".to_string()),
                    &Location::Local(dir.path().join("w")),
                    Some(&record),
                )
                .await;

            assert!(result.is_ok(), "{:?}", result);
            let events = events.into_inner().unwrap();
            let percents: Vec<u8> = events.iter().map(|p| p.percent).collect();
            assert_eq!(percents, vec![25, 50, 100]);
            assert_eq!(events.last().unwrap().transferred, "Complete");
        }

        #[tokio::test]
        async fn test_mirror_nonzero_exit_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let remote = scripted(
                dir.path(),
                "echo 'ERROR : Failed to sync: AccessDenied' >&2\nexit 7\n",
            );

            let events = Mutex::new(Vec::new());
            let record = |p: TransferProgress| events.lock().unwrap().push(p);

            let result = remote
                .mirror(
                    &Location::Local(dir.path().to_path_buf()),
                    &Location::Remote("pass_the_host/w".to_string()),
                    Some(&record),
                )
                .await;

            match result {
                Err(HostError::ProcessFailure { code, message, .. }) => {
                    assert_eq!(code, Some(7));
                    assert!(message.contains("AccessDenied"));
                }
                other => panic!("Unexpected result: {:?}", other),
            }
            assert!(events.into_inner().unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_cat_missing_object_is_none() {
            let dir = tempfile::tempdir().unwrap();
            let remote = scripted(dir.path(), "echo 'object not found' >&2\nexit 3\n");

            let content = remote.cat("pass_the_host/w/server.lock").await.unwrap();
            assert!(content.is_none());
        }

        #[tokio::test]
        async fn test_cat_of_empty_object_is_some() {
            let dir = tempfile::tempdir().unwrap();
            let remote = scripted(dir.path(), "exit 0\n");

            let content = remote.cat("pass_the_host/w/server.lock").await.unwrap();
            assert_eq!(content.as_deref(), Some(""));
        }

        #[tokio::test]
        async fn test_cat_temporary_error_is_transient() {
            let dir = tempfile::tempdir().unwrap();
            let remote = scripted(dir.path(), "echo 'dial tcp: i/o timeout' >&2\nexit 5\n");

            let err = remote.cat("pass_the_host/w/server.lock").await.unwrap_err();
            assert!(err.is_retryable());
        }

        #[tokio::test]
        async fn test_size_parses_json() {
            let dir = tempfile::tempdir().unwrap();
            let remote = scripted(
                dir.path(),
                "echo '{\"count\":12,\"bytes\":4096,\"sizeless\":0}'\n",
            );

            let size = remote.size("pass_the_host").await.unwrap();
            assert_eq!(size, StorageSize { count: 12, bytes: 4096 });
        }

        #[tokio::test]
        async fn test_missing_program_is_process_failure() {
            let remote = RcloneRemote::new("/nonexistent/rclone-binary", target());

            match remote.check_access().await {
                Err(HostError::ProcessFailure { code: None, .. }) => {}
                other => panic!("Unexpected result: {:?}", other),
            }
        }
    }
}
