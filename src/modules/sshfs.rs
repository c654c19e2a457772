//! Process backend: mounts an offer through an external sshfs client.
//!
//! The client runs in the foreground for the whole lifetime of the mount.
//! Two tasks shadow it: a supervisor that waits for the process to exit and
//! releases the mount point, and a watcher that scans its stderr for errors
//! we consider fatal. With `-o reconnect` sshfs would otherwise keep a dead
//! channel around forever.

use super::backend::{program_available, Backend, BackendEvent, BackendKind, BackendNotifier};
use super::config::MountConfig;
use super::constants::{FATAL_MARKER, MOUNT_POINT_MODE};
use super::device::DeviceIdentity;
use super::error::{MountError, Result};
use super::offer::{resolve, DirectoryMap, Location, MountOffer};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Per-device local directory the remote root is mounted on.
#[derive(Debug, Clone, PartialEq)]
pub struct MountPoint {
    /// Directory path
    pub path: PathBuf,
    /// Owning user, passed to sshfs as `uid`
    pub uid: u32,
    /// Owning group, passed to sshfs as `gid`
    pub gid: u32,
}

impl MountPoint {
    /// Ensures `<runtime_dir>/<device_id>` exists and reads back its owner.
    ///
    /// A newly created directory gets mode `0700`; an existing one is left
    /// as it is.
    pub fn prepare(runtime_dir: &Path, device_id: &str) -> Result<Self> {
        let path = runtime_dir.join(device_id.replace('/', "_"));

        fs::create_dir_all(runtime_dir).map_err(|e| setup_error(runtime_dir, e))?;

        match fs::DirBuilder::new().mode(MOUNT_POINT_MODE).create(&path) {
            Ok(()) => {
                fs::set_permissions(&path, fs::Permissions::from_mode(MOUNT_POINT_MODE))
                    .map_err(|e| setup_error(&path, e))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(setup_error(&path, e)),
        }

        let metadata = fs::metadata(&path).map_err(|e| setup_error(&path, e))?;

        Ok(Self {
            path,
            uid: metadata.uid(),
            gid: metadata.gid(),
        })
    }
}

fn setup_error(path: &Path, e: std::io::Error) -> MountError {
    MountError::Setup(format!("{}: {}", path.display(), e))
}

/// Everything one mount attempt needs, captured by `setup`.
#[derive(Clone)]
struct SshfsPlan {
    mount_point: MountPoint,
    host: String,
    port: u16,
    user: String,
    password: String,
    remote_root: String,
}

/// Releases a mount point with the system unmount utility.
#[derive(Debug, Clone)]
struct ForcedUnmount {
    fusermount: String,
    umount: String,
    mount_point: PathBuf,
}

impl ForcedUnmount {
    fn command(&self) -> (String, Vec<OsString>) {
        // fusermount on Linux, plain umount on the BSDs
        if program_available(&self.fusermount) {
            (
                self.fusermount.clone(),
                vec!["-uz".into(), self.mount_point.clone().into_os_string()],
            )
        } else {
            (
                self.umount.clone(),
                vec![self.mount_point.clone().into_os_string()],
            )
        }
    }

    async fn run(&self) {
        let (program, args) = self.command();
        let status = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                debug!("Released {}", self.mount_point.display())
            }
            Ok(status) => debug!("{} exited with {}", program, status),
            Err(e) => debug!("Failed to run {}: {}", program, e),
        }
    }
}

/// Live client process and the tasks shadowing it.
struct ClientHandle {
    finished: Arc<AtomicBool>,
    release: ForcedUnmount,
    stop: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
    watch: JoinHandle<()>,
}

/// Mounts through `sshfs`.
pub struct SshfsBackend {
    config: MountConfig,
    device: DeviceIdentity,
    notifier: BackendNotifier,
    plan: Option<SshfsPlan>,
    client: Option<ClientHandle>,
}

impl SshfsBackend {
    /// Creates an idle backend.
    pub fn new(config: MountConfig, device: DeviceIdentity, notifier: BackendNotifier) -> Self {
        Self {
            config,
            device,
            notifier,
            plan: None,
            client: None,
        }
    }

    /// Mount point prepared by `setup`, if any.
    pub fn mount_point(&self) -> Option<&MountPoint> {
        self.plan.as_ref().map(|plan| &plan.mount_point)
    }
}

#[async_trait]
impl Backend for SshfsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sshfs
    }

    async fn setup(&mut self, offer: &MountOffer) -> Result<DirectoryMap> {
        let runtime_dir = self.config.runtime_dir.clone();
        let device_id = self.device.id.clone();
        let mount_point =
            tokio::task::spawn_blocking(move || MountPoint::prepare(&runtime_dir, &device_id))
                .await
                .map_err(|e| MountError::Setup(format!("mount point task failed: {}", e)))??;

        let host = offer
            .host
            .clone()
            .or_else(|| self.device.host.clone())
            .ok_or_else(|| MountError::InvalidOffer("no host address for peer".to_string()))?;

        let layout = offer.layout()?;
        let directories = resolve(offer, Location::Local(&mount_point.path))?;

        debug!(
            "{}: prepared {} (uid {}, gid {})",
            self.device.name,
            mount_point.path.display(),
            mount_point.uid,
            mount_point.gid
        );

        self.plan = Some(SshfsPlan {
            mount_point,
            host,
            port: offer.port,
            user: offer.user.clone(),
            password: offer.password.clone(),
            remote_root: layout.root,
        });

        Ok(directories)
    }

    async fn mount(&mut self) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| MountError::Mount("mount requested before setup".to_string()))?;

        if self.client.is_some() {
            return Ok(());
        }

        let program = &self.config.sshfs_program;
        let args = client_args(plan, &self.config);
        debug!("{}: spawning {} {:?}", self.device.name, program, args);

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MountError::Mount(format!("failed to spawn {}: {}", program, e)))?;

        let (mut stdin, stderr) = match (child.stdin.take(), child.stderr.take()) {
            (Some(stdin), Some(stderr)) => (stdin, stderr),
            _ => return Err(MountError::Mount("client pipes unavailable".to_string())),
        };

        let finished = Arc::new(AtomicBool::new(false));
        let release = ForcedUnmount {
            fusermount: self.config.fusermount_program.clone(),
            umount: self.config.umount_program.clone(),
            mount_point: plan.mount_point.path.clone(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();

        let watch = tokio::spawn(watch_diagnostics(
            stderr,
            self.device.name.clone(),
            self.notifier.clone(),
        ));
        let supervisor = tokio::spawn(supervise(
            child,
            stop_rx,
            finished.clone(),
            release.clone(),
            self.notifier.clone(),
            self.config.terminate_grace(),
        ));

        self.client = Some(ClientHandle {
            finished,
            release,
            stop: Some(stop_tx),
            supervisor,
            watch,
        });

        write_password(&mut stdin, &plan.password)
            .await
            .map_err(|e| MountError::Mount(format!("failed to send password: {}", e)))?;

        info!(
            "{}: mounted {}:{} on {}",
            self.device.name,
            plan.host,
            plan.remote_root,
            plan.mount_point.path.display()
        );
        Ok(())
    }

    async fn unmount(&mut self) -> Result<()> {
        if let Some(mut client) = self.client.take() {
            client.watch.abort();

            if !client.finished.swap(true, Ordering::SeqCst) {
                client.release.run().await;
            }

            if let Some(stop) = client.stop.take() {
                let _ = stop.send(());
            }
            if let Err(e) = client.supervisor.await {
                debug!("{}: supervisor ended abnormally: {}", self.device.name, e);
            }

            info!(
                "{}: unmounted {}",
                self.device.name,
                client.release.mount_point.display()
            );
        }
        Ok(())
    }
}

fn client_args(plan: &SshfsPlan, config: &MountConfig) -> Vec<OsString> {
    let host = if plan.host.contains(':') {
        format!("[{}]", plan.host)
    } else {
        plan.host.clone()
    };

    let mut args: Vec<OsString> = vec![
        format!("{}@{}:{}", plan.user, host, plan.remote_root).into(),
        plan.mount_point.path.clone().into_os_string(),
        "-p".into(),
        plan.port.to_string().into(),
        // Multi-threaded mode sends file chunks out of order
        "-s".into(),
        "-f".into(),
        // Ignore ~/.ssh/config
        "-F".into(),
        "/dev/null".into(),
    ];

    let options = [
        format!("IdentityFile={}", config.private_key.display()),
        // The peer is already trusted through pairing
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        format!("ServerAliveInterval={}", config.keepalive_secs),
        "delay_connect".to_string(),
        "reconnect".to_string(),
        format!("uid={}", plan.mount_point.uid),
        format!("gid={}", plan.mount_point.gid),
        "password_stdin".to_string(),
    ];

    for option in options {
        args.push("-o".into());
        args.push(option.into());
    }
    args
}

/// Sends the session password the way `-o password_stdin` expects it.
pub async fn write_password<W>(stdin: &mut W, password: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stdin.write_all(format!("{}\n", password).as_bytes()).await?;
    stdin.flush().await
}

/// How a line of client diagnostics is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// The secure channel is gone for good.
    Fatal,
    /// Anything else worth logging.
    Warning,
    /// Nothing to report.
    Blank,
}

/// Classifies one line of sshfs stderr output.
pub fn classify(line: &str) -> Diagnostic {
    if line.contains(FATAL_MARKER) {
        Diagnostic::Fatal
    } else if line.trim().is_empty() {
        Diagnostic::Blank
    } else {
        Diagnostic::Warning
    }
}

/// Reads client diagnostics line by line until end-of-stream or a fatal line.
///
/// Runs as its own task; aborting the task is how teardown cancels it.
pub async fn watch_diagnostics<R>(stream: R, device: String, notifier: BackendNotifier)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match classify(&line) {
                Diagnostic::Fatal => {
                    error!("{}: sshfs: {}", device, line);
                    notifier.notify(BackendEvent::Fatal(line));
                    return;
                }
                Diagnostic::Warning => warn!("{}: sshfs: {}", device, line),
                Diagnostic::Blank => {}
            },
            Ok(None) => {
                debug!("{}: sshfs diagnostics closed", device);
                return;
            }
            Err(e) => {
                debug!("{}: reading sshfs diagnostics failed: {}", device, e);
                notifier.notify(BackendEvent::Broken(e.to_string()));
                return;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    mut stop: oneshot::Receiver<()>,
    finished: Arc<AtomicBool>,
    release: ForcedUnmount,
    notifier: BackendNotifier,
    grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => {
            // The exit is authoritative; a failed wait changes nothing.
            match status {
                Ok(status) => debug!("sshfs exited: {}", status),
                Err(e) => debug!("waiting for sshfs failed: {}", e),
            }
            true
        }
        _ = &mut stop => false,
    };

    if !exited {
        terminate(&mut child, grace).await;
    }

    if !finished.swap(true, Ordering::SeqCst) {
        release.run().await;
        notifier.notify(BackendEvent::Exited);
    }
}

// SIGTERM first so sshfs can flush and detach, SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to sshfs ({}) failed: {}", pid, e);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            debug!("sshfs terminated: {:?}", status);
            return;
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Killing sshfs failed: {}", e);
    }
}
