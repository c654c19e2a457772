//! Native backend: mounts an offer through the desktop volume facility.

use super::backend::{Backend, BackendEvent, BackendKind, BackendNotifier};
use super::device::DeviceIdentity;
use super::error::{MountError, Result};
use super::offer::{resolve, DirectoryMap, Location, MountOffer};
use super::volume::{MountOperation, VolumeMount, VolumeService};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

struct NativePlan {
    uri: String,
    operation: MountOperation,
}

/// Mounts `sftp://host:port/` as a native volume.
pub struct NativeBackend {
    volumes: Arc<dyn VolumeService>,
    device: DeviceIdentity,
    notifier: BackendNotifier,
    plan: Option<NativePlan>,
    mount: Option<VolumeMount>,
    subscription: Option<JoinHandle<()>>,
}

impl NativeBackend {
    /// Creates an idle backend.
    pub fn new(
        volumes: Arc<dyn VolumeService>,
        device: DeviceIdentity,
        notifier: BackendNotifier,
    ) -> Self {
        Self {
            volumes,
            device,
            notifier,
            plan: None,
            mount: None,
            subscription: None,
        }
    }

    /// Volume URI prepared by `setup`, if any.
    pub fn uri(&self) -> Option<&str> {
        self.plan.as_ref().map(|plan| plan.uri.as_str())
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn setup(&mut self, offer: &MountOffer) -> Result<DirectoryMap> {
        let host = offer
            .host
            .clone()
            .or_else(|| self.device.host.clone())
            .ok_or_else(|| MountError::InvalidOffer("no host address for peer".to_string()))?;

        let directories = resolve(
            offer,
            Location::Remote {
                host: &host,
                port: offer.port,
            },
        )?;

        self.plan = Some(NativePlan {
            uri: format!("sftp://{}:{}/", host, offer.port),
            operation: MountOperation::new(&offer.user, &offer.password),
        });

        Ok(directories)
    }

    async fn mount(&mut self) -> Result<()> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| MountError::Mount("mount requested before setup".to_string()))?;

        self.volumes
            .mount_enclosing_volume(&plan.uri, &plan.operation)
            .await
            .map_err(|e| match e {
                MountError::Mount(_) => e,
                other => MountError::Mount(other.to_string()),
            })?;

        let mount = self
            .volumes
            .mounts()
            .await?
            .into_iter()
            .find(|m| m.has_root(&plan.uri))
            .ok_or_else(|| MountError::Mount(format!("{} not in mount inventory", plan.uri)))?;

        // One subscription per backend; it outlives remounts.
        if self.subscription.is_none() {
            let mut unmounted = self.volumes.watch_unmounted(&mount).await?;
            let notifier = self.notifier.clone();
            self.subscription = Some(tokio::spawn(async move {
                while unmounted.recv().await.is_some() {
                    notifier.notify(BackendEvent::Detached);
                }
            }));
        }

        info!("{}: mounted {} ({})", self.device.name, plan.uri, mount.name);
        self.mount = Some(mount);
        Ok(())
    }

    async fn remount(&mut self) -> Result<()> {
        debug!("{}: volume unmounted, remounting", self.device.name);
        self.mount().await
    }

    async fn unmount(&mut self) -> Result<()> {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
        }

        let (mount, plan) = match (self.mount.take(), self.plan.as_ref()) {
            (Some(mount), Some(plan)) => (mount, plan),
            _ => return Ok(()),
        };

        let operation = plan.operation.clone().with_choice(0);
        match self.volumes.unmount_with_operation(&mount, &operation).await {
            Ok(()) => {
                info!("{}: unmounted {}", self.device.name, mount.root_uri);
                Ok(())
            }
            Err(e) => {
                warn!("{}: unmounting {} failed: {}", self.device.name, mount.root_uri, e);
                Err(match e {
                    MountError::Unmount(_) => e,
                    other => MountError::Unmount(other.to_string()),
                })
            }
        }
    }
}
