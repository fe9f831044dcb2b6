//! Remote session over the ssh and sftp binaries (RemoteSession).
//!
//! Freshly provisioned machines have no prior known-hosts entry, so
//! host-key checking is disabled and the known-hosts file is /dev/null.
//! That is the trust model for disposable CI sandboxes; stricter
//! environments should front this with their own known-hosts
//! management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::command_runner::CommandRunner;
use crate::error::ProvisionError;

/// Fixed provisioning account inside every sandbox image.
pub const SSH_USER: &str = "gitlab-runner";

/// Overall retry budget for the first connection.
pub const CONNECT_BUDGET: Duration = Duration::from_secs(30);

/// Cadence between connection attempts.
pub const CONNECT_POLL: Duration = Duration::from_secs(2);

/// Classification of a failed connection attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnectFailure {
    /// Host not yet routable. Expected in the window between "the VM
    /// has an IP" and "sshd is accepting". Retried.
    Transient,
    /// Everything else: auth, DNS, protocol, refused. Not retried.
    Fatal,
}

/// Map an ssh client failure to retry-or-abort.
///
/// The transient set is deliberately narrow. "Connection refused" is
/// fatal because the readiness signal only fires after sshd is up, so
/// a refusal past that point means the account or service is broken.
pub(crate) fn classify_connect_failure(stderr: &str) -> ConnectFailure {
    if stderr.contains("No route to host") || stderr.contains("Network is unreachable") {
        ConnectFailure::Transient
    } else {
        ConnectFailure::Fatal
    }
}

/// One authenticated channel to a provisioned machine. Each
/// `exec`/`upload` call opens its own ssh or sftp process underneath.
#[derive(Debug)]
pub struct RemoteSession<R: CommandRunner> {
    runner: R,
    host: String,
    key_path: PathBuf,
}

impl<R: CommandRunner> RemoteSession<R> {
    /// Connect with bounded retry against transient early-boot
    /// failures.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::Connect`] immediately on a non-transient
    /// failure; [`ProvisionError::ConnectTimeout`] once `budget` is
    /// exhausted. Never silently succeeds.
    pub async fn connect_with_retry(
        runner: R,
        host: &str,
        key_path: &Path,
        budget: Duration,
        poll: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + budget;
        let probe = probe_args(host, key_path);
        let probe_refs = to_refs(&probe);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let output = runner
                .run("ssh", &probe_refs)
                .await
                .context("running ssh probe")?;
            if output.status.success() {
                tracing::debug!(host, attempt, "ssh connection established");
                return Ok(Self {
                    runner,
                    host: host.to_string(),
                    key_path: key_path.to_path_buf(),
                });
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            if classify_connect_failure(&stderr) == ConnectFailure::Fatal {
                return Err(ProvisionError::Connect {
                    host: host.to_string(),
                    detail: stderr.trim().to_string(),
                }
                .into());
            }
            tracing::debug!(host, attempt, "host not routable yet, retrying");

            if Instant::now() + poll > deadline {
                return Err(ProvisionError::ConnectTimeout {
                    host: host.to_string(),
                    budget,
                }
                .into());
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Copy a local file to the machine via sftp.
    ///
    /// # Errors
    ///
    /// Fatal on any failure, wrapped with source and destination.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        tracing::debug!(host = %self.host, local = %local.display(), remote, "uploading file");
        let batch = format!("put {} {remote}\n", local.display());
        let mut args = common_options(&self.key_path);
        args.push("-b".to_string());
        args.push("-".to_string());
        args.push(format!("{SSH_USER}@{}", self.host));
        let output = self
            .runner
            .run_with_stdin("sftp", &to_refs(&args), batch.as_bytes())
            .await
            .with_context(|| {
                format!("uploading '{}' to '{}:{remote}'", local.display(), self.host)
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "uploading '{}' to '{}:{remote}': {}",
                local.display(),
                self.host,
                stderr.trim()
            );
        }
        Ok(())
    }

    /// Run a command on the machine, streaming merged stdout/stderr
    /// into `sink` as it is produced, and return the remote exit code.
    ///
    /// A non-zero remote exit is a result value, not an error. The
    /// caller decides whether it is fatal for the invocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the ssh process cannot be spawned or the
    /// output stream breaks.
    pub async fn exec(
        &self,
        command: &str,
        args: &[&str],
        sink: &mut (impl AsyncWrite + Unpin),
    ) -> Result<i32> {
        // Merge the remote streams remotely so ordering is preserved.
        let remote_cmdline = format!("{} 2>&1", shell_join(command, args));
        tracing::debug!(host = %self.host, cmdline = %remote_cmdline, "executing remote command");

        let mut ssh_args = common_options(&self.key_path);
        ssh_args.push(format!("{SSH_USER}@{}", self.host));
        ssh_args.push(remote_cmdline);

        let mut child = self.runner.spawn("ssh", &to_refs(&ssh_args))?;
        let mut stdout = child.stdout.take().context("ssh stdout not piped")?;

        let mut buf = [0u8; 8192];
        loop {
            let n = stdout
                .read(&mut buf)
                .await
                .context("reading remote output")?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .await
                .context("forwarding remote output")?;
            sink.flush().await.context("flushing remote output")?;
        }

        let status = child.wait().await.context("waiting for ssh")?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn common_options(key_path: &Path) -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "ConnectTimeout=5".to_string(),
        "-i".to_string(),
        key_path.display().to_string(),
    ]
}

fn probe_args(host: &str, key_path: &Path) -> Vec<String> {
    let mut args = common_options(key_path);
    args.push(format!("{SSH_USER}@{host}"));
    args.push("true".to_string());
    args
}

fn to_refs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

/// Join a command and its arguments into one shell-safe remote
/// command line.
fn shell_join(command: &str, args: &[&str]) -> String {
    let mut parts = vec![shell_quote(command)];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Output;
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{err_output, ok_output};

    #[test]
    fn only_unroutable_conditions_are_transient() {
        assert_eq!(
            classify_connect_failure("ssh: connect to host vm1 port 22: No route to host"),
            ConnectFailure::Transient
        );
        assert_eq!(
            classify_connect_failure("ssh: connect to host vm1 port 22: Network is unreachable"),
            ConnectFailure::Transient
        );
        assert_eq!(
            classify_connect_failure("gitlab-runner@vm1: Permission denied (publickey)."),
            ConnectFailure::Fatal
        );
        assert_eq!(
            classify_connect_failure("ssh: Could not resolve hostname vm1"),
            ConnectFailure::Fatal
        );
        assert_eq!(
            classify_connect_failure("ssh: connect to host vm1 port 22: Connection refused"),
            ConnectFailure::Fatal
        );
    }

    #[test]
    fn shell_join_quotes_unsafe_words() {
        assert_eq!(shell_join("/bin/echo", &["hi"]), "/bin/echo hi");
        assert_eq!(
            shell_join("/bin/echo", &["hello world"]),
            "/bin/echo 'hello world'"
        );
        assert_eq!(shell_join("/bin/echo", &["it's"]), r"/bin/echo 'it'\''s'");
        assert_eq!(shell_join("/bin/echo", &[""]), "/bin/echo ''");
    }

    #[test]
    fn probe_disables_host_key_checks_and_names_the_key() {
        let args = probe_args("vm1", Path::new("/keys/id_ed25519"));
        assert!(args.windows(2).any(|w| w == ["-o", "StrictHostKeyChecking=no"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert_eq!(args.last().map(String::as_str), Some("true"));
        assert!(args.contains(&"gitlab-runner@vm1".to_string()));
    }

    /// Scripted runner: pops one canned output per `run` call.
    #[derive(Debug)]
    struct SequencedRunner {
        outputs: Mutex<Vec<Output>>,
        calls: Mutex<u32>,
    }

    impl SequencedRunner {
        fn new(outputs: Vec<Output>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("lock")
        }
    }

    impl CommandRunner for &SequencedRunner {
        async fn run(&self, _: &str, _: &[&str]) -> Result<Output> {
            *self.calls.lock().expect("lock") += 1;
            let mut outputs = self.outputs.lock().expect("lock");
            anyhow::ensure!(!outputs.is_empty(), "ran out of scripted outputs");
            Ok(outputs.remove(0))
        }
        async fn run_with_timeout(&self, p: &str, a: &[&str], _: Duration) -> Result<Output> {
            self.run(p, a).await
        }
        async fn run_with_stdin(&self, _: &str, _: &[&str], _: &[u8]) -> Result<Output> {
            anyhow::bail!("not expected")
        }
        fn spawn(&self, _: &str, _: &[&str]) -> Result<tokio::process::Child> {
            anyhow::bail!("not expected")
        }
    }

    fn no_route() -> Output {
        err_output(255, b"ssh: connect to host vm1 port 22: No route to host")
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let runner = SequencedRunner::new(vec![no_route(), no_route(), ok_output(b"")]);
        RemoteSession::connect_with_retry(
            &runner,
            "vm1",
            Path::new("/keys/id_ed25519"),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn fatal_failure_aborts_without_retry() {
        let runner = SequencedRunner::new(vec![err_output(
            255,
            b"gitlab-runner@vm1: Permission denied (publickey).",
        )]);
        let err = RemoteSession::connect_with_retry(
            &runner,
            "vm1",
            Path::new("/keys/id_ed25519"),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .expect_err("auth failure is fatal");
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Connect { .. })
        ));
        assert_eq!(runner.calls(), 1, "no retry after a fatal failure");
    }

    #[tokio::test]
    async fn exhausted_budget_is_a_connect_timeout() {
        let runner = SequencedRunner::new(vec![no_route(); 50]);
        let err = RemoteSession::connect_with_retry(
            &runner,
            "vm1",
            Path::new("/keys/id_ed25519"),
            Duration::from_millis(80),
            Duration::from_millis(30),
        )
        .await
        .expect_err("budget runs out");
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::ConnectTimeout { .. })
        ));
    }

    /// Runner whose `spawn` launches a local shell command instead of
    /// ssh, so streaming can be exercised without a network.
    struct LocalShellRunner {
        script: &'static str,
    }

    impl CommandRunner for LocalShellRunner {
        async fn run(&self, _: &str, _: &[&str]) -> Result<Output> {
            Ok(ok_output(b""))
        }
        async fn run_with_timeout(&self, _: &str, _: &[&str], _: Duration) -> Result<Output> {
            Ok(ok_output(b""))
        }
        async fn run_with_stdin(&self, _: &str, _: &[&str], _: &[u8]) -> Result<Output> {
            Ok(ok_output(b""))
        }
        fn spawn(&self, _: &str, _: &[&str]) -> Result<tokio::process::Child> {
            Ok(tokio::process::Command::new("/bin/sh")
                .args(["-c", self.script])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()?)
        }
    }

    #[tokio::test]
    async fn exec_streams_output_and_returns_the_exit_code() {
        let session = RemoteSession {
            runner: LocalShellRunner { script: "echo hi" },
            host: "vm1".to_string(),
            key_path: PathBuf::from("/keys/id_ed25519"),
        };
        let mut sink = Vec::new();
        let code = session
            .exec("/bin/echo", &["hi"], &mut sink)
            .await
            .expect("exec");
        assert_eq!(code, 0);
        assert_eq!(sink, b"hi\n");
    }

    #[tokio::test]
    async fn exec_surfaces_nonzero_exit_as_a_value() {
        let session = RemoteSession {
            runner: LocalShellRunner { script: "exit 3" },
            host: "vm1".to_string(),
            key_path: PathBuf::from("/keys/id_ed25519"),
        };
        let mut sink = Vec::new();
        let code = session
            .exec("/bin/false", &[], &mut sink)
            .await
            .expect("exec itself succeeds");
        assert_eq!(code, 3);
    }
}
