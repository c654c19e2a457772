//! Backend capability shared by the sshfs and native volume strategies.

use super::config::MountConfig;
use super::device::DeviceIdentity;
use super::error::Result;
use super::native::NativeBackend;
use super::offer::{DirectoryMap, MountOffer};
use super::session::SessionEvent;
use super::sshfs::SshfsBackend;
use super::volume::VolumeService;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Which strategy a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// External sshfs client process
    Sshfs,
    /// Native volume mount facility
    Native,
}

/// Signals a backend raises on its own, outside of any call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// The client reported an unrecoverable secure-channel failure.
    Fatal(String),
    /// The client process exited and its mount point was released.
    Exited,
    /// The diagnostic stream failed before end-of-stream.
    Broken(String),
    /// The mounted volume went away without us asking.
    Detached,
}

/// Routes backend events to the owning session, tagged with the attempt
/// that created the backend.
#[derive(Debug, Clone)]
pub struct BackendNotifier {
    attempt: u64,
    tx: UnboundedSender<SessionEvent>,
}

impl BackendNotifier {
    /// Creates a notifier for `attempt`.
    pub fn new(attempt: u64, tx: UnboundedSender<SessionEvent>) -> Self {
        Self { attempt, tx }
    }

    /// Attempt generation this notifier belongs to.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Delivers an event. Dropped silently once the session is gone.
    pub fn notify(&self, event: BackendEvent) {
        let attempt = self.attempt;
        if self.tx.send(SessionEvent::Backend { attempt, event }).is_err() {
            debug!("Session gone, dropping backend event for attempt {}", attempt);
        }
    }
}

/// A strategy for making an offer's paths available locally.
///
/// `setup` always completes before `mount` starts; `unmount` may be called
/// at any point after `setup`, including after a failed `mount`.
#[async_trait]
pub trait Backend: Send {
    /// Strategy implemented by this backend.
    fn kind(&self) -> BackendKind;

    /// Prepares everything `mount` needs and returns the directories the
    /// mount will expose.
    async fn setup(&mut self, offer: &MountOffer) -> Result<DirectoryMap>;

    /// Establishes access.
    async fn mount(&mut self) -> Result<()>;

    /// Single recovery attempt after an out-of-band unmount.
    async fn remount(&mut self) -> Result<()> {
        self.mount().await
    }

    /// Releases access. Best-effort.
    async fn unmount(&mut self) -> Result<()>;
}

/// Creates a backend for each mount attempt.
pub trait BackendFactory: Send + Sync {
    /// Picks and builds a backend for `device`.
    fn create(&self, device: &DeviceIdentity, notifier: BackendNotifier) -> Box<dyn Backend>;
}

/// Whether `program` resolves to an executable, either as a path or on `PATH`.
pub fn program_available(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Picks sshfs when installed, otherwise the native volume facility.
///
/// Availability is checked on every call, so a client installed (or removed)
/// between attempts is picked up.
pub struct SystemBackends {
    config: MountConfig,
    volumes: Arc<dyn VolumeService>,
}

impl SystemBackends {
    /// Creates a factory over `config` and a native volume service.
    pub fn new(config: MountConfig, volumes: Arc<dyn VolumeService>) -> Self {
        Self { config, volumes }
    }

    /// Strategy the next attempt will use.
    pub fn select(&self) -> BackendKind {
        if program_available(&self.config.sshfs_program) {
            BackendKind::Sshfs
        } else {
            BackendKind::Native
        }
    }
}

impl BackendFactory for SystemBackends {
    fn create(&self, device: &DeviceIdentity, notifier: BackendNotifier) -> Box<dyn Backend> {
        match self.select() {
            BackendKind::Sshfs => Box::new(SshfsBackend::new(
                self.config.clone(),
                device.clone(),
                notifier,
            )),
            BackendKind::Native => {
                warn!(
                    "{}: {} not found: falling back to native volume mount",
                    device.name, self.config.sshfs_program
                );
                Box::new(NativeBackend::new(
                    self.volumes.clone(),
                    device.clone(),
                    notifier,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::device::TransportClass;
    use crate::modules::volume::tests::FakeVolumes;
    use tokio::sync::mpsc;

    fn device() -> DeviceIdentity {
        DeviceIdentity {
            id: "a1b2c3".to_string(),
            name: "Pixel".to_string(),
            host: Some("10.0.0.2".to_string()),
            transport: TransportClass::Lan,
        }
    }

    #[test]
    fn test_falls_back_to_native() {
        let config = MountConfig {
            sshfs_program: "peermount-no-such-sshfs".to_string(),
            ..MountConfig::default()
        };
        let factory = SystemBackends::new(config, Arc::new(FakeVolumes::default()));
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(factory.select(), BackendKind::Native);
        let backend = factory.create(&device(), BackendNotifier::new(1, tx));
        assert_eq!(backend.kind(), BackendKind::Native);
    }

    #[test]
    fn test_prefers_sshfs_when_resolvable() {
        // Any executable stands in for the client here; only resolution matters.
        let config = MountConfig {
            sshfs_program: "sh".to_string(),
            ..MountConfig::default()
        };
        let factory = SystemBackends::new(config, Arc::new(FakeVolumes::default()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let backend = factory.create(&device(), BackendNotifier::new(1, tx));
        assert_eq!(backend.kind(), BackendKind::Sshfs);
    }

    #[test]
    fn test_notifier_tags_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = BackendNotifier::new(7, tx);
        notifier.notify(BackendEvent::Exited);

        match rx.try_recv() {
            Ok(SessionEvent::Backend { attempt, event }) => {
                assert_eq!(attempt, 7);
                assert_eq!(event, BackendEvent::Exited);
            }
            _ => panic!("expected a backend event"),
        }
    }
}
