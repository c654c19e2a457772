//! Native volume mount facility.
//!
//! [`VolumeService`] is the narrow slice of a desktop virtual filesystem the
//! native backend needs: mount the volume enclosing a URI, list live mounts,
//! hear about a mount going away, and unmount it again. [`GioVolumes`]
//! implements it on top of the `gio` command line tool.

use super::constants::VOLUME_OP_TIMEOUT;
use super::error::{MountError, Result};
use async_trait::async_trait;
use log::debug;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

// More prompts than user, domain, password and one question means the
// credentials were rejected and we are being asked again.
const MAX_PROMPTS: usize = 4;

/// Whether the volume facility may store the password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSave {
    /// Never store it
    Never,
    /// Keep it for the login session
    ForSession,
    /// Store it in the keyring
    Permanently,
}

/// Outcome of answering a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOperationResult {
    /// Answered
    Handled,
    /// Refused; the operation fails
    Aborted,
    /// Not answered
    Unhandled,
}

/// An interactive request raised during a mount or unmount.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Login name
    Username,
    /// Authentication domain
    Domain,
    /// Password
    Password,
    /// Multiple-choice question, e.g. an unknown host key
    Question {
        /// Offered answers, in order
        choices: Vec<String>,
    },
}

impl Prompt {
    /// Recognizes a prompt at the end of interactive output.
    ///
    /// Prompts are a trailing `Label: ` or `Label [default]: ` without a
    /// newline; questions list their choices as `[n] text` lines above a
    /// `Choice: ` prompt.
    pub fn parse(output: &str) -> Option<Prompt> {
        let last = output.rsplit('\n').next()?.trim();
        let label = last.strip_suffix(':')?;
        let label = label.split('[').next().unwrap_or(label).trim();

        match label {
            "User" => Some(Prompt::Username),
            "Domain" => Some(Prompt::Domain),
            "Password" => Some(Prompt::Password),
            "Choice" => {
                let choices = output
                    .lines()
                    .filter_map(|line| {
                        let line = line.trim();
                        let rest = line.strip_prefix('[')?;
                        let (index, text) = rest.split_once(']')?;
                        index.parse::<usize>().ok()?;
                        Some(text.trim().to_string())
                    })
                    .collect();
                Some(Prompt::Question { choices })
            }
            _ => None,
        }
    }
}

/// Credentials and answering policy for a mount or unmount.
///
/// Credentials come from the offer and the host is already trusted, so every
/// prompt is answered without involving the user.
#[derive(Clone)]
pub struct MountOperation {
    /// Login name
    pub username: String,
    password: String,
    /// Password storage policy
    pub password_save: PasswordSave,
    /// Choice picked for questions
    pub choice: usize,
}

impl fmt::Debug for MountOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOperation")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("password_save", &self.password_save)
            .field("choice", &self.choice)
            .finish()
    }
}

impl MountOperation {
    /// Creates an operation that never saves the password and picks the
    /// first choice of any question.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            password_save: PasswordSave::Never,
            choice: 0,
        }
    }

    /// Overrides the choice picked for questions.
    pub fn with_choice(mut self, choice: usize) -> Self {
        self.choice = choice;
        self
    }

    /// Answers a prompt.
    pub fn reply(&self, prompt: &Prompt) -> (MountOperationResult, String) {
        match prompt {
            Prompt::Username => (MountOperationResult::Handled, self.username.clone()),
            Prompt::Domain => (MountOperationResult::Handled, String::new()),
            Prompt::Password => (MountOperationResult::Handled, self.password.clone()),
            Prompt::Question { .. } => (MountOperationResult::Handled, self.choice.to_string()),
        }
    }
}

/// A live mount known to the volume facility.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMount {
    /// Display name
    pub name: String,
    /// URI of the mount root
    pub root_uri: String,
}

impl VolumeMount {
    /// Whether this mount's root is `uri`, ignoring a trailing slash.
    pub fn has_root(&self, uri: &str) -> bool {
        self.root_uri.trim_end_matches('/') == uri.trim_end_matches('/')
    }
}

/// Delivers one message each time a watched mount disappears.
///
/// Dropping the subscription stops the watch.
pub struct UnmountSubscription {
    rx: UnboundedReceiver<()>,
    task: Option<JoinHandle<()>>,
}

impl UnmountSubscription {
    /// Wraps a receiver and the task feeding it, if any.
    pub fn new(rx: UnboundedReceiver<()>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Waits for the next unmount. `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl Drop for UnmountSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Native asynchronous mount facility.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Mounts the volume that contains `uri`.
    async fn mount_enclosing_volume(&self, uri: &str, operation: &MountOperation) -> Result<()>;

    /// Lists live mounts.
    async fn mounts(&self) -> Result<Vec<VolumeMount>>;

    /// Subscribes to out-of-band unmounts of `mount`.
    async fn watch_unmounted(&self, mount: &VolumeMount) -> Result<UnmountSubscription>;

    /// Unmounts `mount`, answering prompts with `operation`.
    async fn unmount_with_operation(
        &self,
        mount: &VolumeMount,
        operation: &MountOperation,
    ) -> Result<()>;
}

/// [`VolumeService`] backed by the `gio` tool.
#[derive(Debug, Clone)]
pub struct GioVolumes {
    program: String,
}

impl GioVolumes {
    /// Uses `program` as the gio binary.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    // Runs gio, answering prompts on its stdout through `operation`.
    async fn run_interactive(
        &self,
        args: &[&str],
        operation: &MountOperation,
    ) -> Result<(ExitStatus, String)> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (mut stdin, mut stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    return Err(MountError::Mount(format!(
                        "{} pipes unavailable",
                        self.program
                    )))
                }
            };

        let diagnostics = tokio::spawn(async move {
            let mut text = String::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        let mut pending = String::new();
        let mut prompts = 0;
        let mut buf = [0u8; 1024];
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            if let Some(prompt) = Prompt::parse(&pending) {
                prompts += 1;
                if prompts > MAX_PROMPTS {
                    return Err(MountError::Mount("credentials rejected".to_string()));
                }
                let (result, answer) = operation.reply(&prompt);
                if result != MountOperationResult::Handled {
                    return Err(MountError::Mount(format!("{:?} not answered", prompt)));
                }
                debug!("{}: answering {:?}", self.program, prompt);
                stdin.write_all(format!("{}\n", answer).as_bytes()).await?;
                stdin.flush().await?;
                pending.clear();
            }
        }
        drop(stdin);

        let status = child.wait().await?;
        let diagnostics = diagnostics.await.unwrap_or_default();
        Ok((status, diagnostics))
    }

    async fn run_with_timeout(
        &self,
        args: &[&str],
        operation: &MountOperation,
    ) -> Result<(ExitStatus, String)> {
        tokio::time::timeout(VOLUME_OP_TIMEOUT, self.run_interactive(args, operation))
            .await
            .map_err(|_| MountError::Mount(format!("{} {:?} timed out", self.program, args)))?
    }
}

#[async_trait]
impl VolumeService for GioVolumes {
    async fn mount_enclosing_volume(&self, uri: &str, operation: &MountOperation) -> Result<()> {
        let (status, diagnostics) = self.run_with_timeout(&["mount", uri], operation).await?;

        if status.success() {
            Ok(())
        } else if diagnostics.contains("already mounted") {
            debug!("{} is already mounted", uri);
            Ok(())
        } else {
            Err(MountError::Mount(diagnostics.trim().to_string()))
        }
    }

    async fn mounts(&self) -> Result<Vec<VolumeMount>> {
        let output = Command::new(&self.program)
            .args(["mount", "-l"])
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(MountError::Mount(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(parse_mount_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn watch_unmounted(&self, mount: &VolumeMount) -> Result<UnmountSubscription> {
        let mut child = Command::new(&self.program)
            .args(["mount", "-o"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MountError::Mount(format!("{} monitor has no stdout", self.program)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let volumes = self.clone();
        let root = mount.root_uri.clone();

        let task = tokio::spawn(async move {
            // Owned here so aborting the task kills the monitor.
            let _monitor = child;
            let mut lines = BufReader::new(stdout).lines();
            let mut present = true;

            while let Ok(Some(line)) = lines.next_line().await {
                if !line.starts_with("Mount") {
                    continue;
                }
                let now = match volumes.mounts().await {
                    Ok(mounts) => mounts.iter().any(|m| m.has_root(&root)),
                    Err(e) => {
                        debug!("Listing mounts failed: {}", e);
                        continue;
                    }
                };
                if present && !now && tx.send(()).is_err() {
                    break;
                }
                present = now;
            }
        });

        Ok(UnmountSubscription::new(rx, Some(task)))
    }

    async fn unmount_with_operation(
        &self,
        mount: &VolumeMount,
        operation: &MountOperation,
    ) -> Result<()> {
        let (status, diagnostics) = self
            .run_with_timeout(&["mount", "-u", mount.root_uri.as_str()], operation)
            .await
            .map_err(|e| MountError::Unmount(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(MountError::Unmount(diagnostics.trim().to_string()))
        }
    }
}

/// Parses `gio mount -l` output into mounts.
pub fn parse_mount_list(output: &str) -> Vec<VolumeMount> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line.strip_prefix("Mount(")?;
            let (_, rest) = rest.split_once("): ")?;
            let (name, uri) = rest.rsplit_once(" -> ")?;
            Some(VolumeMount {
                name: name.to_string(),
                root_uri: uri.trim().to_string(),
            })
        })
        .collect()
}
