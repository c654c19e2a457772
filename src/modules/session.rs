//! Mount session management.
//!
//! A [`MountSession`] is the single authority over one device's mount state.
//! All state lives in an actor task that handles [`SessionEvent`]s one at a
//! time; the handle only queues events and exposes read-only views of the
//! state and published directories.
//!
//! Mount attempts run in their own tasks so the actor stays responsive while
//! a backend is busy. Each attempt gets a generation number. Anything a
//! backend reports, and the attempt's own outcome, carries that number, so
//! results from an attempt the session has since abandoned are recognised
//! and cleaned up instead of being applied.

use super::backend::{Backend, BackendEvent, BackendFactory, BackendNotifier};
use super::constants::{PACKET_TYPE_SFTP, PACKET_TYPE_SFTP_REQUEST};
use super::device::{
    DeviceIdentity, DirectoryPublisher, ErrorReporter, Packet, Transport, TransportClass,
};
use super::error::{MountError, Result};
use super::offer::{DirectoryMap, MountOffer};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Mount state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// Nothing mounted, nothing in flight
    Unmounted,
    /// An attempt is in flight
    Mounting,
    /// Directories are published
    Mounted,
}

/// Result of one mount attempt, handed back to the session with the backend
/// that produced it.
pub struct AttemptOutcome {
    attempt: u64,
    backend: Box<dyn Backend>,
    result: Result<DirectoryMap>,
}

/// Messages handled by the session actor.
pub enum SessionEvent {
    /// A parsed offer
    Offer(MountOffer),
    /// An inbound packet
    Packet(Packet),
    /// Ask the peer to send an offer
    RequestMount,
    /// Tear down whatever is mounted or in flight
    Unmount,
    /// The device connected
    Connected,
    /// The device disconnected
    Disconnected,
    /// A mount attempt finished
    Attempt(AttemptOutcome),
    /// A backend raised an event on its own
    Backend {
        /// Generation of the attempt that created the backend
        attempt: u64,
        /// What happened
        event: BackendEvent,
    },
    /// Acknowledged once every earlier event has been handled
    Flush(oneshot::Sender<()>),
    /// Unmount and stop the actor
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Outbound packets to the peer
    pub transport: Arc<dyn Transport>,
    /// User-facing error notifications
    pub reporter: Arc<dyn ErrorReporter>,
    /// Directory actions in the UI
    pub publisher: Arc<dyn DirectoryPublisher>,
    /// Backend selection
    pub backends: Arc<dyn BackendFactory>,
}

/// Handle to a running mount session.
///
/// # Example
///
/// ```no_run
/// # use peermount::*;
/// # use std::sync::Arc;
/// # async fn demo(device: DeviceIdentity, collaborators: Collaborators, offer: MountOffer) -> peermount::Result<()> {
/// let session = MountSession::spawn(device, collaborators);
/// session.offer(offer)?;
///
/// let mut state = session.subscribe();
/// let _ = state.wait_for(|s| *s != MountState::Mounting).await;
/// for (name, uri) in session.directories().iter() {
///     println!("{} -> {}", name, uri);
/// }
///
/// session.destroy().await?;
/// # Ok(())
/// # }
/// ```
pub struct MountSession {
    tx: UnboundedSender<SessionEvent>,
    state: watch::Receiver<MountState>,
    directories: Arc<RwLock<DirectoryMap>>,
    task: Option<JoinHandle<()>>,
}

impl MountSession {
    /// Starts the session actor for `device`.
    pub fn spawn(device: DeviceIdentity, collaborators: Collaborators) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(MountState::Unmounted);
        let directories = Arc::new(RwLock::new(DirectoryMap::new()));

        info!("Session started for {} ({})", device.name, device.id);

        let actor = SessionActor {
            device,
            collaborators,
            tx: tx.clone(),
            state: state_tx,
            directories: directories.clone(),
            attempt: 0,
            backend: None,
        };
        let task = tokio::spawn(actor.run(rx));

        Self {
            tx,
            state: state_rx,
            directories,
            task: Some(task),
        }
    }

    fn send(&self, event: SessionEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| MountError::SessionClosed)
    }

    /// Starts a mount from an offer unless one is mounted or in flight.
    pub fn offer(&self, offer: MountOffer) -> Result<()> {
        self.send(SessionEvent::Offer(offer))
    }

    /// Dispatches an inbound packet.
    pub fn handle_packet(&self, packet: Packet) -> Result<()> {
        self.send(SessionEvent::Packet(packet))
    }

    /// Asks the peer to send an offer.
    pub fn request_mount(&self) -> Result<()> {
        self.send(SessionEvent::RequestMount)
    }

    /// Unmounts, or abandons an in-flight attempt.
    pub fn unmount(&self) -> Result<()> {
        self.send(SessionEvent::Unmount)
    }

    /// Device connected hook.
    pub fn connected(&self) -> Result<()> {
        self.send(SessionEvent::Connected)
    }

    /// Device disconnected hook.
    pub fn disconnected(&self) -> Result<()> {
        self.send(SessionEvent::Disconnected)
    }

    /// Current state.
    pub fn state(&self) -> MountState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<MountState> {
        self.state.clone()
    }

    /// Snapshot of the published directories.
    pub fn directories(&self) -> DirectoryMap {
        self.directories.read().clone()
    }

    /// Resolves once every event queued before this call has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionEvent::Flush(tx))?;
        rx.await.map_err(|_| MountError::SessionClosed)
    }

    /// Unmounts and stops the session.
    pub async fn destroy(mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionEvent::Shutdown(Some(tx)))?;
        let _ = rx.await;
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| MountError::Unmount(format!("session task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if self.task.is_some() && self.tx.send(SessionEvent::Shutdown(None)).is_err() {
            debug!("Session already stopped");
        }
    }
}

struct SessionActor {
    device: DeviceIdentity,
    collaborators: Collaborators,
    tx: UnboundedSender<SessionEvent>,
    state: watch::Sender<MountState>,
    directories: Arc<RwLock<DirectoryMap>>,
    attempt: u64,
    backend: Option<Box<dyn Backend>>,
}

impl SessionActor {
    async fn run(mut self, mut rx: UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Offer(offer) => self.on_offer(offer),
                SessionEvent::Packet(packet) => self.on_packet(packet),
                SessionEvent::RequestMount => self.request_mount(),
                SessionEvent::Unmount => self.unmount().await,
                SessionEvent::Connected => self.connected(),
                SessionEvent::Disconnected => self.unmount().await,
                SessionEvent::Attempt(outcome) => self.on_attempt(outcome).await,
                SessionEvent::Backend { attempt, event } => self.on_backend(attempt, event).await,
                SessionEvent::Flush(ack) => {
                    let _ = ack.send(());
                }
                SessionEvent::Shutdown(ack) => {
                    info!("{}: shutting down session", self.device.name);
                    self.unmount().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }
        debug!("{}: session stopped", self.device.name);
    }

    fn current(&self) -> MountState {
        *self.state.borrow()
    }

    // Bluetooth links are too slow for sftp
    fn mounting_supported(&self) -> bool {
        self.device.transport != TransportClass::Bluetooth
    }

    fn set_state(&self, state: MountState) {
        self.state.send_replace(state);
    }

    fn on_packet(&mut self, packet: Packet) {
        // Never mount on top of an existing mount
        if self.current() == MountState::Mounted {
            return;
        }
        if packet.packet_type != PACKET_TYPE_SFTP {
            debug!("{}: ignoring {} packet", self.device.name, packet.packet_type);
            return;
        }
        match MountOffer::from_body(&packet.body) {
            Ok(offer) => self.on_offer(offer),
            Err(e) => error!("{}: {}", self.device.name, e),
        }
    }

    fn on_offer(&mut self, offer: MountOffer) {
        if !self.mounting_supported() {
            debug!("{}: mounting unsupported on this transport", self.device.name);
            return;
        }
        match self.current() {
            MountState::Mounted => return,
            MountState::Mounting => {
                // Let the in-flight attempt fail before retrying
                debug!("{}: mount already in progress", self.device.name);
                return;
            }
            MountState::Unmounted => {}
        }

        self.attempt += 1;
        self.set_state(MountState::Mounting);

        let attempt = self.attempt;
        let offer = offer.with_host(self.device.host.as_deref());
        let notifier = BackendNotifier::new(attempt, self.tx.clone());
        let mut backend = self.collaborators.backends.create(&self.device, notifier);
        debug!(
            "{}: attempt {} using {:?} backend",
            self.device.name,
            attempt,
            backend.kind()
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match backend.setup(&offer).await {
                Ok(directories) => backend.mount().await.map(|()| directories),
                Err(e) => Err(e),
            };

            let outcome = AttemptOutcome {
                attempt,
                backend,
                result,
            };
            if let Err(mpsc::error::SendError(SessionEvent::Attempt(mut outcome))) =
                tx.send(SessionEvent::Attempt(outcome))
            {
                // Session is gone; nobody else will release this backend.
                if let Err(e) = outcome.backend.unmount().await {
                    warn!("Releasing orphaned attempt {} failed: {}", attempt, e);
                }
            }
        });
    }

    async fn on_attempt(&mut self, outcome: AttemptOutcome) {
        let AttemptOutcome {
            attempt,
            mut backend,
            result,
        } = outcome;

        if attempt != self.attempt || self.current() != MountState::Mounting {
            // Abandoned while in flight; nothing of it may survive.
            match &result {
                Ok(_) => warn!(
                    "{}: attempt {} completed after unmount, releasing it",
                    self.device.name, attempt
                ),
                Err(e) => debug!("{}: abandoned attempt {} failed: {}", self.device.name, attempt, e),
            }
            if let Err(e) = backend.unmount().await {
                warn!("{}: {}", self.device.name, e);
            }
            return;
        }

        self.backend = Some(backend);
        match result {
            Ok(directories) => {
                info!(
                    "{}: mounted {} directories",
                    self.device.name,
                    directories.len()
                );
                *self.directories.write() = directories.clone();
                self.set_state(MountState::Mounted);
                self.collaborators.publisher.publish(&directories);
            }
            Err(e) => {
                error!("{}: {}", self.device.name, e);
                self.unmount().await;
            }
        }
    }

    async fn on_backend(&mut self, attempt: u64, event: BackendEvent) {
        if attempt != self.attempt || self.current() == MountState::Unmounted {
            debug!(
                "{}: ignoring {:?} from stale attempt {}",
                self.device.name, event, attempt
            );
            return;
        }

        match event {
            BackendEvent::Fatal(message) => {
                let error = MountError::FatalBackendSignal(message);
                self.collaborators.reporter.notify_error(&self.device, &error);
                self.unmount().await;
            }
            BackendEvent::Exited => {
                info!("{}: sshfs exited", self.device.name);
                self.unmount().await;
            }
            BackendEvent::Broken(message) => {
                debug!("{}: diagnostics failed: {}", self.device.name, message);
                self.unmount().await;
            }
            BackendEvent::Detached => {
                let remounted = match self.backend.as_mut() {
                    Some(backend) => backend.remount().await,
                    None => return,
                };
                // One retry only; a second failure tears everything down.
                if let Err(e) = remounted {
                    warn!("{}: remount failed: {}", self.device.name, e);
                    self.unmount().await;
                }
            }
        }
    }

    fn request_mount(&self) {
        if !self.mounting_supported() {
            return;
        }
        self.collaborators.transport.send_packet(Packet::new(
            PACKET_TYPE_SFTP_REQUEST,
            json!({ "startBrowsing": true }),
        ));
    }

    fn connected(&self) {
        let supported = self.mounting_supported();
        self.collaborators.publisher.set_actions_enabled(supported);
        if supported {
            // sshfs delays connecting until first access, so this is cheap
            self.request_mount();
        }
    }

    async fn unmount(&mut self) {
        if self.current() == MountState::Unmounted {
            return;
        }

        // Invalidates the in-flight attempt and anything its backend reports.
        self.attempt += 1;

        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.unmount().await {
                warn!("{}: {}", self.device.name, e);
            }
        }

        self.directories.write().clear();
        self.set_state(MountState::Unmounted);
        self.collaborators.publisher.retract();
        info!("{}: unmounted", self.device.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::backend::BackendKind;
    use crate::modules::backend::SystemBackends;
    use crate::modules::config::MountConfig;
    use crate::modules::constants::{FATAL_MARKER, LABEL_ALL_FILES, LABEL_CAMERA};
    use crate::modules::volume::tests::FakeVolumes;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Packet>>,
        errors: Mutex<Vec<String>>,
        published: Mutex<Vec<DirectoryMap>>,
        retracted: Mutex<usize>,
        actions_enabled: Mutex<Option<bool>>,
    }

    impl Transport for Recorder {
        fn send_packet(&self, packet: Packet) {
            self.sent.lock().push(packet);
        }
    }

    impl ErrorReporter for Recorder {
        fn notify_error(&self, _device: &DeviceIdentity, error: &MountError) {
            self.errors.lock().push(error.to_string());
        }
    }

    impl DirectoryPublisher for Recorder {
        fn publish(&self, directories: &DirectoryMap) {
            self.published.lock().push(directories.clone());
        }

        fn retract(&self) {
            *self.retracted.lock() += 1;
        }

        fn set_actions_enabled(&self, enabled: bool) {
            *self.actions_enabled.lock() = Some(enabled);
        }
    }

    #[derive(Default)]
    struct Calls {
        created: usize,
        setups: usize,
        mounts: usize,
        remounts: usize,
        unmounts: usize,
        notifier: Option<BackendNotifier>,
    }

    #[derive(Default)]
    struct FakeBackends {
        calls: Arc<Mutex<Calls>>,
        gate: Option<Arc<Notify>>,
        fail_mount: bool,
        fail_remount: bool,
    }

    struct FakeBackend {
        calls: Arc<Mutex<Calls>>,
        gate: Option<Arc<Notify>>,
        fail_mount: bool,
        fail_remount: bool,
    }

    impl BackendFactory for FakeBackends {
        fn create(&self, _device: &DeviceIdentity, notifier: BackendNotifier) -> Box<dyn Backend> {
            let mut calls = self.calls.lock();
            calls.created += 1;
            calls.notifier = Some(notifier);
            Box::new(FakeBackend {
                calls: self.calls.clone(),
                gate: self.gate.clone(),
                fail_mount: self.fail_mount,
                fail_remount: self.fail_remount,
            })
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Sshfs
        }

        async fn setup(&mut self, offer: &MountOffer) -> Result<DirectoryMap> {
            self.calls.lock().setups += 1;
            crate::modules::offer::resolve(
                offer,
                crate::modules::offer::Location::Local(std::path::Path::new("/mnt/fake")),
            )
        }

        async fn mount(&mut self) -> Result<()> {
            self.calls.lock().mounts += 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_mount {
                return Err(MountError::Mount("connection refused".to_string()));
            }
            Ok(())
        }

        async fn remount(&mut self) -> Result<()> {
            self.calls.lock().remounts += 1;
            if self.fail_remount {
                return Err(MountError::Mount("connection refused".to_string()));
            }
            Ok(())
        }

        async fn unmount(&mut self) -> Result<()> {
            self.calls.lock().unmounts += 1;
            Ok(())
        }
    }

    fn device(transport: TransportClass) -> DeviceIdentity {
        DeviceIdentity {
            id: "a1b2c3".to_string(),
            name: "Pixel".to_string(),
            host: Some("10.0.0.2".to_string()),
            transport,
        }
    }

    fn offer() -> MountOffer {
        MountOffer {
            host: None,
            port: 1739,
            user: "kdeconnect".to_string(),
            password: "hunter2".to_string(),
            path: Some("/storage/emulated/0".to_string()),
            multi_paths: None,
            path_names: None,
        }
    }

    fn start(
        transport: TransportClass,
        backends: Arc<dyn BackendFactory>,
    ) -> (MountSession, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let collaborators = Collaborators {
            transport: recorder.clone(),
            reporter: recorder.clone(),
            publisher: recorder.clone(),
            backends,
        };
        (MountSession::spawn(device(transport), collaborators), recorder)
    }

    async fn wait_for_state(session: &MountSession, state: MountState) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("state change timed out")
            .expect("session stopped");
    }

    #[tokio::test]
    async fn test_offer_mounts_and_publishes() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;

        let dirs = session.directories();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs.get(LABEL_ALL_FILES), Some("file:///mnt/fake"));
        assert_eq!(dirs.get(LABEL_CAMERA), Some("file:///mnt/fake/DCIM/Camera"));
        assert_eq!(recorder.published.lock().len(), 1);

        session.unmount()?;
        session.flush().await?;
        assert_eq!(session.state(), MountState::Unmounted);
        assert!(session.directories().is_empty());
        assert_eq!(*recorder.retracted.lock(), 1);
        assert_eq!(backends.calls.lock().unmounts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unmount_when_unmounted_is_noop() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.unmount()?;
        session.flush().await?;

        assert_eq!(session.state(), MountState::Unmounted);
        assert_eq!(*recorder.retracted.lock(), 0);
        assert_eq!(backends.calls.lock().unmounts, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_offer_while_mounting_is_dropped() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let backends = Arc::new(FakeBackends {
            gate: Some(gate.clone()),
            ..FakeBackends::default()
        });
        let (session, _recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        session.offer(offer())?;
        session.flush().await?;
        assert_eq!(session.state(), MountState::Mounting);

        gate.notify_one();
        wait_for_state(&session, MountState::Mounted).await;

        let calls = backends.calls.lock();
        assert_eq!(calls.created, 1);
        assert_eq!(calls.mounts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_offer_while_mounted_is_ignored() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, _recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;
        session.offer(offer())?;
        session.flush().await?;

        assert_eq!(backends.calls.lock().created, 1);
        assert_eq!(session.state(), MountState::Mounted);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_mount_resets_state() -> Result<()> {
        let backends = Arc::new(FakeBackends {
            fail_mount: true,
            ..FakeBackends::default()
        });
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        session.flush().await?;
        wait_for_state(&session, MountState::Unmounted).await;
        session.flush().await?;

        assert!(recorder.published.lock().is_empty());
        assert_eq!(backends.calls.lock().unmounts, 1);

        // A later offer starts a fresh attempt with a freshly selected backend
        session.offer(offer())?;
        session.flush().await?;
        assert_eq!(backends.calls.lock().created, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_late_mount_success_is_released() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let backends = Arc::new(FakeBackends {
            gate: Some(gate.clone()),
            ..FakeBackends::default()
        });
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        session.flush().await?;
        assert_eq!(session.state(), MountState::Mounting);

        session.unmount()?;
        session.flush().await?;
        assert_eq!(session.state(), MountState::Unmounted);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), async {
            while backends.calls.lock().unmounts == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("late attempt was not released");
        session.flush().await?;

        assert_eq!(session.state(), MountState::Unmounted);
        assert!(recorder.published.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_signal_unmounts_and_reports() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;

        let notifier = backends.calls.lock().notifier.clone().unwrap();
        notifier.notify(BackendEvent::Fatal(format!(
            "{}: Connection to 10.0.0.2 port 1739: Broken pipe",
            FATAL_MARKER
        )));
        wait_for_state(&session, MountState::Unmounted).await;
        session.flush().await?;

        assert_eq!(recorder.errors.lock().len(), 1);
        assert_eq!(*recorder.retracted.lock(), 1);

        // The backend is gone; further events from it change nothing
        notifier.notify(BackendEvent::Fatal(FATAL_MARKER.to_string()));
        session.flush().await?;
        assert_eq!(recorder.errors.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_client_exit_unmounts_without_report() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;

        let notifier = backends.calls.lock().notifier.clone().unwrap();
        notifier.notify(BackendEvent::Exited);
        wait_for_state(&session, MountState::Unmounted).await;

        assert!(recorder.errors.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_detach_remounts_once() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, _recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;

        let notifier = backends.calls.lock().notifier.clone().unwrap();
        notifier.notify(BackendEvent::Detached);
        session.flush().await?;

        assert_eq!(backends.calls.lock().remounts, 1);
        assert_eq!(session.state(), MountState::Mounted);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_remount_unmounts() -> Result<()> {
        let backends = Arc::new(FakeBackends {
            fail_remount: true,
            ..FakeBackends::default()
        });
        let (session, _recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;

        let notifier = backends.calls.lock().notifier.clone().unwrap();
        notifier.notify(BackendEvent::Detached);
        session.flush().await?;

        let calls = backends.calls.lock();
        assert_eq!(calls.remounts, 1);
        assert_eq!(calls.unmounts, 1);
        assert_eq!(session.state(), MountState::Unmounted);
        Ok(())
    }

    #[tokio::test]
    async fn test_bluetooth_never_mounts() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Bluetooth, backends.clone());

        session.connected()?;
        session.offer(offer())?;
        session.request_mount()?;
        session.flush().await?;

        assert_eq!(session.state(), MountState::Unmounted);
        assert_eq!(backends.calls.lock().created, 0);
        assert_eq!(*recorder.actions_enabled.lock(), Some(false));
        assert!(recorder.sent.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_bluetooth_ignores_offers_before_connected() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Bluetooth, backends.clone());

        session.offer(offer())?;
        session.handle_packet(Packet::new(
            PACKET_TYPE_SFTP,
            json!({ "port": 1739, "user": "u", "password": "p", "path": "/sdcard" }),
        ))?;
        session.request_mount()?;
        session.flush().await?;

        assert_eq!(session.state(), MountState::Unmounted);
        assert_eq!(backends.calls.lock().created, 0);
        assert!(recorder.sent.lock().is_empty());
        assert!(recorder.published.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_orphaned_attempt_releases_backend() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let backends = Arc::new(FakeBackends {
            gate: Some(gate.clone()),
            ..FakeBackends::default()
        });
        let (session, _recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        session.destroy().await?;

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), async {
            while backends.calls.lock().unmounts == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("orphaned attempt was not released");
        Ok(())
    }

    #[tokio::test]
    async fn test_connected_requests_offer() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Lan, backends);

        session.connected()?;
        session.flush().await?;

        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PACKET_TYPE_SFTP_REQUEST);
        assert_eq!(sent[0].body, json!({ "startBrowsing": true }));
        Ok(())
    }

    #[tokio::test]
    async fn test_packet_dispatch() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, _recorder) = start(TransportClass::Lan, backends.clone());

        session.handle_packet(Packet::new("kdeconnect.ping", json!({})))?;
        session.handle_packet(Packet::new(
            PACKET_TYPE_SFTP,
            json!({ "port": 1739, "user": "u", "password": "p", "multiPaths": ["/a"] }),
        ))?;
        session.flush().await?;
        assert_eq!(backends.calls.lock().created, 0);

        session.handle_packet(Packet::new(
            PACKET_TYPE_SFTP,
            json!({
                "port": 1739,
                "user": "kdeconnect",
                "password": "hunter2",
                "multiPaths": ["/a/b/c", "/a/b/d"],
                "pathNames": ["C", "D"]
            }),
        ))?;
        wait_for_state(&session, MountState::Mounted).await;

        let dirs = session.directories();
        assert_eq!(dirs.get("C"), Some("file:///mnt/fake/c"));
        assert_eq!(dirs.get("D"), Some("file:///mnt/fake/d"));
        Ok(())
    }

    #[tokio::test]
    async fn test_falls_back_to_native_backend() -> Result<()> {
        let volumes = Arc::new(FakeVolumes::default());
        let config = MountConfig {
            sshfs_program: "peermount-no-such-sshfs".to_string(),
            ..MountConfig::default()
        };
        let backends = Arc::new(SystemBackends::new(config, volumes.clone()));
        let (session, recorder) = start(TransportClass::Lan, backends);

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;

        assert_eq!(
            session.directories().get(LABEL_ALL_FILES),
            Some("sftp://10.0.0.2:1739/storage/emulated/0")
        );
        assert_eq!(volumes.state.lock().mount_calls, 1);
        assert!(recorder.errors.lock().is_empty());

        session.destroy().await?;
        assert_eq!(volumes.state.lock().unmount_calls, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_destroy_unmounts() -> Result<()> {
        let backends = Arc::new(FakeBackends::default());
        let (session, recorder) = start(TransportClass::Lan, backends.clone());

        session.offer(offer())?;
        wait_for_state(&session, MountState::Mounted).await;
        session.destroy().await?;

        assert_eq!(backends.calls.lock().unmounts, 1);
        assert_eq!(*recorder.retracted.lock(), 1);
        Ok(())
    }
}
