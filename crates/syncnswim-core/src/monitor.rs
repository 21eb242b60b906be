//! Mount/unmount monitoring.
//!
//! [`DeviceMonitor`] polls the [`DeviceLocator`] on a fixed interval and
//! tracks a two-state machine. Entering [`MonitorState::Mounted`] runs one
//! sync pass; polling pauses until the pass is done.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

use crate::device::{DeviceLocator, ResolvedMount};
use crate::fs::FileSystem;
use crate::store::WritableStore;
use crate::sync::{BatchSyncManager, SyncReport};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls between heartbeats while waiting for the device (about a minute).
pub const DEFAULT_HEARTBEAT_EVERY: u64 = 12;

/// Whether the device is currently mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    /// Device absent.
    Unmounted,
    /// Device present.
    Mounted,
}

impl MonitorState {
    /// State implied by a locator result.
    pub const fn derive(resolved: Option<&ResolvedMount>) -> Self {
        if resolved.is_some() {
            Self::Mounted
        } else {
            Self::Unmounted
        }
    }
}

/// Result of feeding one sample to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Unmounted to mounted; a sync pass is due.
    Mounted(ResolvedMount),
    /// Mounted to unmounted; the held store was released.
    Unmounted,
    /// No change while unmounted, on a heartbeat poll.
    Heartbeat {
        /// Polls so far.
        polls: u64,
    },
    /// No change.
    Unchanged,
}

/// Events emitted by a running monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum MonitorEvent {
    /// The device appeared at this mount path.
    Mounted(std::path::PathBuf),
    /// The device went away.
    Unmounted,
    /// Still waiting for the device.
    Heartbeat {
        /// Polls so far.
        polls: u64,
        /// Approximate time spent waiting.
        waited_secs: u64,
    },
    /// A sync pass finished.
    SyncCompleted(SyncReport),
}

/// Totals reported when the monitor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Polls performed after the initial sample.
    pub polls: u64,
    /// Sync passes run.
    pub passes: u64,
}

/// Handle for stopping a running monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<MonitorSummary>,
}

impl MonitorHandle {
    /// Stop the monitor after its current poll or pass and wait for it.
    pub async fn stop(self) -> MonitorSummary {
        let _ = self.shutdown_tx.send(()).await;
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Monitor task failed: {}", e);
                MonitorSummary::default()
            }
        }
    }
}

/// Polling state machine driving sync passes.
pub struct DeviceMonitor {
    locator: Arc<DeviceLocator>,
    manager: Arc<BatchSyncManager>,
    fs: Arc<dyn FileSystem>,
    subdirectory: String,
    poll_interval: Duration,
    heartbeat_every: u64,
    state: MonitorState,
    store: Option<WritableStore>,
    summary: MonitorSummary,
}

impl DeviceMonitor {
    /// Create a monitor that writes into `subdirectory` of the device.
    pub fn new(
        locator: Arc<DeviceLocator>,
        manager: Arc<BatchSyncManager>,
        fs: Arc<dyn FileSystem>,
        subdirectory: impl Into<String>,
    ) -> Self {
        Self {
            locator,
            manager,
            fs,
            subdirectory: subdirectory.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_every: DEFAULT_HEARTBEAT_EVERY,
            state: MonitorState::Unmounted,
            store: None,
            summary: MonitorSummary::default(),
        }
    }

    /// Override the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override how many polls pass between heartbeats.
    #[must_use]
    pub fn with_heartbeat_every(mut self, polls: u64) -> Self {
        self.heartbeat_every = polls.max(1);
        self
    }

    /// Current state.
    pub const fn state(&self) -> MonitorState {
        self.state
    }

    /// Store bound to the mounted device, if any.
    pub const fn store(&self) -> Option<&WritableStore> {
        self.store.as_ref()
    }

    /// Feed one locator sample to the state machine.
    pub fn observe(&mut self, resolved: Option<ResolvedMount>) -> Transition {
        self.summary.polls += 1;
        let next = MonitorState::derive(resolved.as_ref());

        match (self.state, next, resolved) {
            (MonitorState::Unmounted, MonitorState::Mounted, Some(resolved)) => {
                self.state = MonitorState::Mounted;
                Transition::Mounted(resolved)
            }
            (MonitorState::Mounted, MonitorState::Unmounted, _) => {
                self.state = MonitorState::Unmounted;
                self.store = None;
                Transition::Unmounted
            }
            (MonitorState::Unmounted, _, _) if self.summary.polls % self.heartbeat_every == 0 => {
                Transition::Heartbeat {
                    polls: self.summary.polls,
                }
            }
            _ => Transition::Unchanged,
        }
    }

    /// Spawn the monitor loop, returning its event stream and a stop handle.
    pub fn start(self) -> (mpsc::Receiver<MonitorEvent>, MonitorHandle) {
        let (event_tx, event_rx) = mpsc::channel::<MonitorEvent>(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(self.run(shutdown_rx, event_tx));
        (event_rx, MonitorHandle { shutdown_tx, task })
    }

    /// Run until a shutdown message arrives or the sender is dropped.
    pub async fn run(
        mut self,
        mut shutdown: mpsc::Receiver<()>,
        events: mpsc::Sender<MonitorEvent>,
    ) -> MonitorSummary {
        info!(
            "Monitoring for device '{}' every {:?}",
            self.locator.target(),
            self.poll_interval
        );

        if let Some(resolved) = self.sample().await {
            info!("Device already mounted at {}", resolved.mount_path.display());
            self.state = MonitorState::Mounted;
            self.on_mounted(resolved, &events).await;
        }

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Device monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let resolved = self.sample().await;
                    match self.observe(resolved) {
                        Transition::Mounted(resolved) => {
                            info!(
                                "Device mounted at {} (check #{})",
                                resolved.mount_path.display(),
                                self.summary.polls
                            );
                            self.on_mounted(resolved, &events).await;
                        }
                        Transition::Unmounted => {
                            info!("Device unmounted (check #{})", self.summary.polls);
                            let _ = events.send(MonitorEvent::Unmounted).await;
                        }
                        Transition::Heartbeat { polls } => {
                            let waited_secs = self.poll_interval.as_secs() * polls;
                            info!(
                                "Still waiting for device... (check #{}, ~{} min elapsed)",
                                polls,
                                waited_secs / 60
                            );
                            let _ = events.send(MonitorEvent::Heartbeat { polls, waited_secs }).await;
                        }
                        Transition::Unchanged => {}
                    }
                }
            }
        }

        self.summary
    }

    async fn sample(&self) -> Option<ResolvedMount> {
        let locator = Arc::clone(&self.locator);
        match tokio::task::spawn_blocking(move || locator.resolve()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Device detection task failed: {}", e);
                None
            }
        }
    }

    async fn on_mounted(&mut self, resolved: ResolvedMount, events: &mpsc::Sender<MonitorEvent>) {
        let store = WritableStore::for_mount(
            &resolved,
            &self.subdirectory,
            Arc::clone(&self.fs),
            self.locator.inspector(),
        );
        self.store = Some(store.clone());
        let _ = events
            .send(MonitorEvent::Mounted(resolved.mount_path))
            .await;

        let manager = Arc::clone(&self.manager);
        match tokio::task::spawn_blocking(move || manager.sync(&store)).await {
            Ok(report) => {
                self.summary.passes += 1;
                let _ = events.send(MonitorEvent::SyncCompleted(report)).await;
            }
            Err(e) => error!("Sync pass failed: {}", e),
        }
    }
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("target", self.locator.target())
            .field("state", &self.state)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
