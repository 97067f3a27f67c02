use crate::device::Device;
use crate::error::Error;
use crate::progress::MountPrompt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cadence of the automatic readiness re-check while a gate is closed.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

const PROBE_FILE: &str = ".drivespan-probe";

/// Worker side of the two-phase rendezvous: announce interest, then block
/// until the keeper confirms the device is mounted and writable.
pub(crate) struct WorkerGate {
    request: SyncSender<()>,
    grant: Receiver<()>,
}

/// Keeper side: receives the worker's request and answers once the device
/// passes its readiness probe.
pub(crate) struct KeeperGate {
    request: Receiver<()>,
    grant: SyncSender<()>,
}

pub(crate) fn gate() -> (WorkerGate, KeeperGate) {
    let (request_tx, request_rx) = sync_channel(0);
    let (grant_tx, grant_rx) = sync_channel(0);
    (
        WorkerGate {
            request: request_tx,
            grant: grant_rx,
        },
        KeeperGate {
            request: request_rx,
            grant: grant_tx,
        },
    )
}

impl WorkerGate {
    /// Blocks until the keeper opens the gate. A closed channel means the
    /// session is shutting down.
    pub fn wait_open(&self) -> Result<(), Error> {
        self.request.send(()).map_err(|_| Error::Done)?;
        self.grant.recv().map_err(|_| Error::Done)
    }
}

/// Probes whether a device is present and writable: by filesystem UUID when
/// one is configured, then mount point existence, then a write test.
pub fn ensure_device_ready(device: &Device) -> Result<(), Error> {
    if let Some(uuid) = &device.uuid {
        let by_uuid = Path::new("/dev/disk/by-uuid").join(uuid);
        if !by_uuid.exists() {
            return Err(Error::DeviceNotFound {
                device: device.name.clone(),
                uuid: Some(uuid.clone()),
            });
        }
    }
    if !device.mount_point.is_dir() {
        return Err(Error::DeviceNotFound {
            device: device.name.clone(),
            uuid: device.uuid.clone(),
        });
    }

    let probe = device.mount_point.join(PROBE_FILE);
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(source) => Err(Error::DeviceNotWritable {
            device: device.name.clone(),
            mount_point: device.mount_point.clone(),
            source,
        }),
    }
}

/// Operator-facing message for a failed readiness probe.
pub fn prompt_message(err: &Error) -> String {
    match err {
        Error::DeviceNotFound { .. } => "Please mount device and press Enter to continue...".into(),
        Error::DeviceNotWritable { .. } => {
            "Device is mounted but not writable... Please fix write permissions then press Enter to continue."
                .into()
        }
        other => other.to_string(),
    }
}

/// Keeper loop for one device, meant to run on its own thread. Waits for
/// the worker's request, then probes until the device is ready, re-checking
/// every [`POLL_INTERVAL`] or immediately on an operator retry signal.
pub(crate) fn keep(
    device: Device,
    index: usize,
    gate: KeeperGate,
    prompts: SyncSender<MountPrompt>,
    retry: Receiver<()>,
    exit: Arc<AtomicBool>,
) {
    if gate.request.recv().is_err() {
        return;
    }
    debug!(device = %device.name, "worker requested device");

    loop {
        if exit.load(Ordering::Relaxed) {
            // Dropping the grant sender wakes the worker with a Done.
            return;
        }
        match ensure_device_ready(&device) {
            Ok(()) => {
                let _ = prompts.try_send(MountPrompt::Ready { device: index });
                let _ = gate.grant.send(());
                return;
            }
            Err(err) => {
                warn!(device = %device.name, error = %err, "device not ready");
                let _ = prompts.try_send(MountPrompt::Waiting {
                    device: index,
                    message: prompt_message(&err),
                });
                match retry.recv_timeout(POLL_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        // No operator attached; keep polling on the cadence.
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
            }
        }
    }
}
