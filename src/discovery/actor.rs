// discovery/actor.rs
use super::throttle::DragThrottle;
use super::{Command, DiscoveryOptions, LampCommand, Request, with_deadline};
use crate::device::{DeviceApi, DeviceInfo, DeviceState, StatePatch};
use crate::error::{AppError, DeviceError};
use crate::metrics;
use crate::models::{ConnectionState, DragPhase, LampSnapshot, StatusView};
use crate::storage::AddressStore;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

const DEFAULT_LAMP_NAME: &str = "Sea Lamp";

/// Everything the controller knows about the lamp in this process.
#[derive(Debug, Clone)]
pub(super) struct Session {
    pub state: ConnectionState,
    pub snapshot: LampSnapshot,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Session {
    fn view(&self) -> StatusView {
        StatusView {
            state: self.state.clone(),
            snapshot: self.snapshot.clone(),
            last_sync: self.last_sync,
        }
    }
}

#[derive(Debug)]
pub(super) struct Found {
    host: String,
    info: DeviceInfo,
}

#[derive(Debug)]
pub(super) enum Detection {
    Found(Found),
    /// A saved address stopped answering.
    Lost,
    /// Nothing saved and nothing on the well-known name.
    Missing { access_point: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SyncOrigin {
    Loop,
    Confirm,
}

/// One queued write to the lamp.
pub(super) struct Write {
    patch: StatePatch,
    /// Read the state back once the write landed.
    confirm: bool,
}

pub(super) enum Internal {
    Timer {
        epoch: u64,
    },
    Detected {
        epoch: u64,
        outcome: Detection,
    },
    Probed {
        epoch: u64,
        found: Option<Found>,
        access_point: Option<bool>,
    },
    Synced {
        epoch: u64,
        origin: SyncOrigin,
        result: Result<DeviceState, DeviceError>,
    },
    ColorFlush {
        epoch: u64,
        ticket: u64,
    },
    ManualProbed {
        host: String,
        result: Result<DeviceInfo, DeviceError>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

impl Internal {
    fn epoch(&self) -> Option<u64> {
        match self {
            Internal::Timer { epoch }
            | Internal::Detected { epoch, .. }
            | Internal::Probed { epoch, .. }
            | Internal::Synced { epoch, .. }
            | Internal::ColorFlush { epoch, .. } => Some(*epoch),
            Internal::ManualProbed { .. } => None,
        }
    }
}

pub(super) struct Actor {
    device: Arc<dyn DeviceApi>,
    store: Arc<dyn AddressStore>,
    options: DiscoveryOptions,
    session: Session,
    epoch: u64,
    /// The active state's one background job: a timer, a probe round or a sync.
    job: Option<JoinHandle<()>>,
    side_tasks: Vec<AbortHandle>,
    /// Feeds the connected session's writer; writes land in issue order.
    writer: Option<mpsc::UnboundedSender<Write>>,
    color: DragThrottle<[u8; 3]>,
    events: mpsc::UnboundedSender<Internal>,
    status: watch::Sender<StatusView>,
}

impl Actor {
    pub(super) fn new(
        device: Arc<dyn DeviceApi>,
        store: Arc<dyn AddressStore>,
        options: DiscoveryOptions,
        events: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let session = Session {
            state: ConnectionState::Detecting,
            snapshot: LampSnapshot::default(),
            last_sync: None,
        };
        let (status, _) = watch::channel(session.view());
        Self {
            device,
            store,
            options,
            session,
            epoch: 0,
            job: None,
            side_tasks: Vec::new(),
            writer: None,
            color: DragThrottle::default(),
            events,
            status,
        }
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<StatusView> {
        self.status.subscribe()
    }

    pub(super) async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.enter(ConnectionState::Detecting).await;
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event).await,
            }
        }
        self.cancel_activity();
        debug!("Connection controller stopped");
    }

    fn publish(&self) {
        self.status.send_replace(self.session.view());
    }

    fn cancel_activity(&mut self) {
        self.epoch += 1;
        if let Some(job) = self.job.take() {
            job.abort();
        }
        for task in self.side_tasks.drain(..) {
            task.abort();
        }
        self.writer = None;
        self.color.reset();
    }

    /// The only way the connection state changes.
    async fn enter(&mut self, next: ConnectionState) {
        self.cancel_activity();
        info!(
            from = self.session.state.label(),
            to = next.label(),
            "Connection state change"
        );
        metrics::state_entered(next.label());
        self.session.state = next;

        match self.session.state {
            ConnectionState::Detecting => {
                let persisted = self.persisted().await;
                let device = self.device.clone();
                let options = self.options.clone();
                let epoch = self.epoch;
                self.start_job(async move {
                    let outcome = detect(device.as_ref(), persisted, &options).await;
                    Internal::Detected { epoch, outcome }
                });
            }
            ConnectionState::AwaitingSetup { .. } => {
                self.schedule(self.options.setup_interval);
            }
            ConnectionState::Recovering { .. } => {}
            ConnectionState::Connected { ref host, .. } => {
                let host = host.clone();
                if let Err(e) = self.store.save(&host).await {
                    warn!(%host, error = %e, "Could not persist lamp address");
                }
                self.start_sync();
            }
        }
        self.publish();
    }

    async fn persisted(&self) -> Option<String> {
        match self.store.load().await {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "Could not read saved lamp address");
                None
            }
        }
    }

    /// Saved address first, then the well-known name, without duplicates.
    async fn probe_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.persisted().await.into_iter().collect();
        if !targets.contains(&self.options.well_known_host) {
            targets.push(self.options.well_known_host.clone());
        }
        targets
    }

    fn start_job<F>(&mut self, job: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let events = self.events.clone();
        self.job = Some(tokio::spawn(async move {
            let _ = events.send(job.await);
        }));
    }

    fn spawn_side<F>(&mut self, task: F)
    where
        F: Future<Output = Option<Internal>> + Send + 'static,
    {
        self.side_tasks.retain(|t| !t.is_finished());
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            if let Some(event) = task.await {
                let _ = events.send(event);
            }
        });
        self.side_tasks.push(handle.abort_handle());
    }

    fn schedule(&mut self, after: Duration) {
        let epoch = self.epoch;
        self.start_job(async move {
            tokio::time::sleep(after).await;
            Internal::Timer { epoch }
        });
    }

    fn start_sync(&mut self) {
        let Some(host) = self.session.state.host().map(str::to_owned) else {
            return;
        };
        let device = self.device.clone();
        let limit = self.options.request_timeout;
        let epoch = self.epoch;
        self.start_job(async move {
            let result = with_deadline(limit, device.state(&host)).await;
            Internal::Synced {
                epoch,
                origin: SyncOrigin::Loop,
                result,
            }
        });
    }

    fn start_probe_round(&mut self, targets: Vec<String>, check_access_point: bool) {
        let device = self.device.clone();
        let options = self.options.clone();
        let epoch = self.epoch;
        self.start_job(async move {
            let found = probe_sequence(device.as_ref(), &targets, options.probe_timeout).await;
            let access_point = if found.is_none() && check_access_point {
                Some(probe_access_point(device.as_ref(), &options).await)
            } else {
                None
            };
            Internal::Probed {
                epoch,
                found,
                access_point,
            }
        });
    }

    async fn on_event(&mut self, event: Internal) {
        if let Some(epoch) = event.epoch() {
            if epoch != self.epoch {
                trace!(epoch, current = self.epoch, "Dropping stale event");
                return;
            }
        }

        match event {
            Internal::Timer { .. } => self.on_timer().await,
            Internal::Detected { outcome, .. } => match outcome {
                Detection::Found(found) => self.enter(connected(found)).await,
                Detection::Lost => {
                    self.enter(ConnectionState::Recovering {
                        retrying: false,
                        retries: 0,
                    })
                    .await
                }
                Detection::Missing { access_point } => {
                    self.enter(ConnectionState::AwaitingSetup {
                        attempts: 0,
                        access_point,
                    })
                    .await
                }
            },
            Internal::Probed {
                found,
                access_point,
                ..
            } => self.on_probed(found, access_point).await,
            Internal::Synced { origin, result, .. } => self.on_synced(origin, result),
            Internal::ColorFlush { ticket, .. } => {
                if let (Some(rgb), Some(host)) = (
                    self.color.flush(ticket),
                    self.session.state.host().map(str::to_owned),
                ) {
                    trace!(?rgb, "Flushing throttled colour");
                    let patch = StatePatch::color(rgb).with_transition(self.options.transition);
                    self.send_patch(host, patch, false);
                }
            }
            Internal::ManualProbed {
                host,
                result,
                reply,
            } => {
                let outcome = self.on_manual_probe(host, result).await;
                let _ = reply.send(outcome);
            }
        }
    }

    async fn on_timer(&mut self) {
        match self.session.state {
            ConnectionState::AwaitingSetup { .. } => {
                let targets = self.probe_targets().await;
                self.start_probe_round(targets, true);
            }
            ConnectionState::Connected { .. } => self.start_sync(),
            _ => {}
        }
    }

    async fn on_probed(&mut self, found: Option<Found>, access_point: Option<bool>) {
        if let Some(found) = found {
            self.enter(connected(found)).await;
            return;
        }

        match &mut self.session.state {
            ConnectionState::AwaitingSetup {
                attempts,
                access_point: reachable,
            } => {
                *attempts += 1;
                if let Some(ap) = access_point {
                    *reachable = ap;
                }
                debug!(attempts = *attempts, "Lamp not on the network yet");
            }
            ConnectionState::Recovering { retrying, retries } => {
                *retrying = false;
                *retries += 1;
                info!(retries = *retries, "Lamp still not found");
            }
            _ => return,
        }
        self.publish();
        if matches!(self.session.state, ConnectionState::AwaitingSetup { .. }) {
            self.schedule(self.options.setup_interval);
        }
    }

    fn on_synced(&mut self, origin: SyncOrigin, result: Result<DeviceState, DeviceError>) {
        if !matches!(self.session.state, ConnectionState::Connected { .. }) {
            return;
        }
        match result {
            Ok(state) => {
                metrics::sync_finished(true);
                self.session.snapshot.apply(&state);
                self.session.last_sync = Some(Utc::now());
                self.publish();
            }
            Err(e) => {
                // swallowed: the next cycle tries again
                metrics::sync_finished(false);
                debug!(error = %e, ?origin, "State sync failed");
            }
        }
        if origin == SyncOrigin::Loop {
            self.schedule(self.options.sync_interval);
        }
    }

    async fn on_manual_probe(
        &mut self,
        host: String,
        result: Result<DeviceInfo, DeviceError>,
    ) -> Result<(), AppError> {
        match result {
            Ok(info) => {
                if self.session.state.host() != Some(host.as_str()) {
                    self.enter(connected(Found { host, info })).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(%host, error = %e, "Manual lamp address unreachable");
                Err(AppError::Unreachable { host })
            }
        }
    }

    async fn on_request(&mut self, request: Request) {
        let Request { command, reply } = request;
        let result = match command {
            Command::UseAddress(host) => {
                self.start_manual_probe(host, reply);
                return;
            }
            Command::Lamp(command) => self.on_lamp_command(command),
            Command::Retry => self.retry().await,
            Command::BeginSetup => self.begin_setup().await,
            Command::Disconnect => {
                self.disconnect().await;
                Ok(())
            }
        };
        let _ = reply.send(result);
    }

    /// Runs outside the state's task slots: the user is waiting on the answer.
    fn start_manual_probe(&self, host: String, reply: oneshot::Sender<Result<(), AppError>>) {
        let device = self.device.clone();
        let events = self.events.clone();
        let limit = self.options.probe_timeout;
        tokio::spawn(async move {
            let result = with_deadline(limit, device.info(&host, limit)).await;
            metrics::probe_finished(result.is_ok());
            let _ = events.send(Internal::ManualProbed {
                host,
                result,
                reply,
            });
        });
    }

    async fn retry(&mut self) -> Result<(), AppError> {
        match &mut self.session.state {
            ConnectionState::Recovering { retrying: true, .. } => return Ok(()),
            ConnectionState::Recovering { retrying, .. } => *retrying = true,
            other => {
                return Err(AppError::InvalidState(format!(
                    "retry is only offered while recovering, not while {}",
                    other.label()
                )));
            }
        }
        self.publish();
        let targets = self.probe_targets().await;
        self.start_probe_round(targets, false);
        Ok(())
    }

    async fn begin_setup(&mut self) -> Result<(), AppError> {
        match self.session.state {
            ConnectionState::AwaitingSetup { .. } => Ok(()),
            ConnectionState::Connected { .. } => Err(AppError::InvalidState(
                "the lamp is already connected".into(),
            )),
            _ => {
                self.enter(ConnectionState::AwaitingSetup {
                    attempts: 0,
                    access_point: false,
                })
                .await;
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Could not clear saved lamp address");
        }
        self.session.snapshot = LampSnapshot::default();
        self.session.last_sync = None;
        self.enter(ConnectionState::Detecting).await;
    }

    fn on_lamp_command(&mut self, command: LampCommand) -> Result<(), AppError> {
        let Some(host) = self.session.state.host().map(str::to_owned) else {
            return Err(AppError::NotConnected);
        };
        metrics::command_issued(&command);

        let snapshot = &mut self.session.snapshot;
        let patch = match command {
            LampCommand::SetPower(on) => {
                snapshot.power = on;
                Some(StatePatch::power(on))
            }
            LampCommand::TogglePower => {
                snapshot.power = !snapshot.power;
                Some(StatePatch::toggle())
            }
            LampCommand::Brightness(level, phase) => {
                snapshot.brightness = level;
                (phase == DragPhase::Release).then(|| StatePatch::brightness(level))
            }
            LampCommand::Color(rgb, DragPhase::Move) => {
                snapshot.color = rgb;
                if let Some(ticket) = self.color.offer(rgb) {
                    self.arm_color_flush(ticket);
                }
                None
            }
            LampCommand::Color(rgb, DragPhase::Release) => {
                snapshot.color = rgb;
                Some(StatePatch::color(self.color.commit(rgb)))
            }
            LampCommand::ApplyPreset(id) => {
                snapshot.preset = Some(id);
                Some(StatePatch::preset(id))
            }
        };
        self.publish();

        if let Some(patch) = patch {
            let patch = patch.with_transition(self.options.transition);
            self.send_patch(host, patch, true);
        }
        Ok(())
    }

    fn arm_color_flush(&mut self, ticket: u64) {
        let window = self.options.color_throttle;
        let epoch = self.epoch;
        self.spawn_side(async move {
            tokio::time::sleep(window).await;
            Some(Internal::ColorFlush { epoch, ticket })
        });
    }

    /// Queues a command, optionally followed by a confirmation sync.
    fn send_patch(&mut self, host: String, patch: StatePatch, confirm: bool) {
        let writer = match &self.writer {
            Some(writer) => writer.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(write_lamp(
                    self.device.clone(),
                    host,
                    self.options.request_timeout,
                    self.epoch,
                    rx,
                    self.events.clone(),
                ));
                self.side_tasks.push(task.abort_handle());
                self.writer = Some(tx.clone());
                tx
            }
        };
        if writer.send(Write { patch, confirm }).is_err() {
            warn!("Lamp writer is gone, command dropped");
        }
    }
}

/// Applies one session's writes strictly one after another.
async fn write_lamp(
    device: Arc<dyn DeviceApi>,
    host: String,
    limit: Duration,
    epoch: u64,
    mut writes: mpsc::UnboundedReceiver<Write>,
    events: mpsc::UnboundedSender<Internal>,
) {
    while let Some(Write { patch, confirm }) = writes.recv().await {
        if let Err(e) = with_deadline(limit, device.update(&host, &patch)).await {
            warn!(%host, error = %e, ?patch, "Lamp command failed");
        }
        if confirm {
            let result = with_deadline(limit, device.state(&host)).await;
            let _ = events.send(Internal::Synced {
                epoch,
                origin: SyncOrigin::Confirm,
                result,
            });
        }
    }
}

fn connected(found: Found) -> ConnectionState {
    let name = found.info.name.trim();
    ConnectionState::Connected {
        host: found.host,
        name: if name.is_empty() {
            DEFAULT_LAMP_NAME.to_string()
        } else {
            name.to_string()
        },
    }
}

async fn probe(device: &dyn DeviceApi, host: &str, timeout: Duration) -> Option<DeviceInfo> {
    let result = with_deadline(timeout, device.info(host, timeout)).await;
    metrics::probe_finished(result.is_ok());
    match result {
        Ok(info) => {
            debug!(%host, name = %info.name, ip = ?info.ip(), "Lamp answered");
            Some(info)
        }
        Err(e) => {
            debug!(%host, error = %e, "Probe failed");
            None
        }
    }
}

/// Tries each host in order; the next probe starts only after the previous one settled.
async fn probe_sequence(
    device: &dyn DeviceApi,
    targets: &[String],
    timeout: Duration,
) -> Option<Found> {
    for host in targets {
        if let Some(info) = probe(device, host, timeout).await {
            return Some(Found {
                host: host.clone(),
                info,
            });
        }
    }
    None
}

async fn probe_access_point(device: &dyn DeviceApi, options: &DiscoveryOptions) -> bool {
    probe(
        device,
        &options.access_point_host,
        options.access_point_timeout,
    )
    .await
    .is_some()
}

async fn detect(
    device: &dyn DeviceApi,
    persisted: Option<String>,
    options: &DiscoveryOptions,
) -> Detection {
    if let Some(host) = persisted {
        return match probe(device, &host, options.probe_timeout).await {
            Some(info) => Detection::Found(Found { host, info }),
            None => Detection::Lost,
        };
    }

    let targets = [options.well_known_host.clone()];
    if let Some(found) = probe_sequence(device, &targets, options.probe_timeout).await {
        return Detection::Found(found);
    }
    Detection::Missing {
        access_point: probe_access_point(device, options).await,
    }
}
