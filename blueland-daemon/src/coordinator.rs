/*!
 * Coordinator
 * Sole owner of the device cache. Stack notifications, agent callbacks and
 * frontend commands are applied here one at a time; anything that waits on
 * BlueZ or a human runs in its own task and reports back through the inbox.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentEvent, AuthAnswer, AuthKind, AuthRequest};
use crate::bluez::{BluetoothStack, StackEvent};
use crate::broadcast::{Broadcaster, DeviceEvent, Subscriber};
use crate::device::{Address, DeviceCache, DeviceUpdate};
use crate::error::BtError;
use crate::ipc::{DaemonStatus, Request, Response, Stage};
use crate::prompt::{Answer, CancelSignal, Prompt, Prompter};

enum Event {
    Request(Request, oneshot::Sender<Response>),
    Agent(AgentEvent),
    Subscribe(Subscriber),
    Apply(Address, DeviceUpdate),
    Evict(Address),
    /// Devices reported by the stack; merged, nothing removed.
    Seed(Vec<(Address, DeviceUpdate)>),
    /// Full device list after a stack restart; absent devices are dropped.
    Resync(Vec<(Address, DeviceUpdate)>),
    DiscoveryFinished,
    AgentRegistered(bool),
    PromptFinished { id: Uuid, answer: Answer },
    Shutdown,
}

/// Cloneable entry point into the coordinator.
#[derive(Debug, Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Event>,
}

pub struct Inbox(mpsc::UnboundedReceiver<Event>);

pub fn channel() -> (Handle, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Handle { tx }, Inbox(rx))
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Request(request, _) => write!(f, "Request({:?})", request),
            Event::Agent(event) => write!(f, "Agent({:?})", event),
            Event::Subscribe(_) => f.write_str("Subscribe"),
            Event::Apply(address, _) => write!(f, "Apply({})", address),
            Event::Evict(address) => write!(f, "Evict({})", address),
            Event::Seed(devices) => write!(f, "Seed({})", devices.len()),
            Event::Resync(devices) => write!(f, "Resync({})", devices.len()),
            Event::DiscoveryFinished => f.write_str("DiscoveryFinished"),
            Event::AgentRegistered(ok) => write!(f, "AgentRegistered({})", ok),
            Event::PromptFinished { id, .. } => write!(f, "PromptFinished({})", id),
            Event::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl Handle {
    fn send(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            debug!("Coordinator stopped, dropping {:?}", e.0);
        }
    }

    pub async fn request(&self, request: Request) -> Response {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Request(request, reply));
        rx.await
            .unwrap_or_else(|_| Response::error(BtError::InternalFailure("coordinator stopped".into())))
    }

    /// Hands a stack authentication callback to the coordinator and waits for
    /// the answer. Always resolves; a vanished coordinator counts as a rejection.
    pub async fn authenticate(&self, address: Address, kind: AuthKind) -> Result<AuthAnswer, BtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Agent(AgentEvent::Request(AuthRequest { address, kind, reply })));
        rx.await.unwrap_or(Err(BtError::Rejected))
    }

    pub fn agent(&self, event: AgentEvent) {
        self.send(Event::Agent(event));
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.send(Event::Subscribe(subscriber));
    }

    pub fn shutdown(&self) {
        self.send(Event::Shutdown);
    }

    fn apply(&self, address: &Address, update: DeviceUpdate) {
        self.send(Event::Apply(address.clone(), update));
    }
}

fn respond(reply: oneshot::Sender<Response>, response: Response) {
    if reply.send(response).is_err() {
        debug!("Caller went away before the response was ready");
    }
}

struct PendingAuth {
    id: Uuid,
    address: Address,
    kind: AuthKind,
    reply: oneshot::Sender<Result<AuthAnswer, BtError>>,
    // dropping this tears the prompt down
    _cancel: oneshot::Sender<()>,
}

struct DisplayPrompt {
    id: Uuid,
    kind: AuthKind,
    _cancel: oneshot::Sender<()>,
}

pub struct Coordinator<S, P> {
    stack: Arc<S>,
    prompter: Arc<P>,
    handle: Handle,
    cache: DeviceCache,
    broadcaster: Broadcaster,
    // BlueZ drives one pairing at a time; so does the agent
    auth: Option<PendingAuth>,
    displays: HashMap<Address, DisplayPrompt>,
    discovering: bool,
    agent_registered: bool,
    discovery_window: Duration,
}

impl<S: BluetoothStack, P: Prompter> Coordinator<S, P> {
    pub fn new(stack: Arc<S>, prompter: Arc<P>, handle: Handle, discovery_window: Duration) -> Self {
        Self {
            stack,
            prompter,
            handle,
            cache: DeviceCache::new(),
            broadcaster: Broadcaster::new(),
            auth: None,
            displays: HashMap::new(),
            discovering: false,
            agent_registered: false,
            discovery_window,
        }
    }

    pub fn set_agent_registered(&mut self, registered: bool) {
        self.agent_registered = registered;
    }

    pub fn seed(&mut self, devices: Vec<(Address, DeviceUpdate)>) {
        for (address, update) in devices {
            self.apply(&address, update);
        }
    }

    pub async fn run(mut self, inbox: Inbox, mut stack_events: mpsc::UnboundedReceiver<StackEvent>) {
        let Inbox(mut inbox) = inbox;
        info!("Coordinator running with {} cached devices", self.cache.len());

        loop {
            tokio::select! {
                // stack state lands before commands queued at the same moment
                biased;
                Some(event) = stack_events.recv() => self.on_stack_event(event),
                event = inbox.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.on_event(event),
                },
            }
        }

        self.cancel_all("daemon shutting down");
        info!("Coordinator stopped");
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Request(request, reply) => self.on_request(request, reply),
            Event::Agent(AgentEvent::Request(request)) => self.on_auth_request(request),
            Event::Agent(AgentEvent::Cancel) => {
                // no device given; it can only be the single live request
                self.cancel_all("cancelled by BlueZ");
            }
            Event::Agent(AgentEvent::Released) => {
                self.agent_registered = false;
                self.cancel_all("agent released");
                self.register_agent();
            }
            Event::Subscribe(subscriber) => self.broadcaster.add(subscriber),
            Event::Apply(address, update) => self.apply(&address, update),
            Event::Evict(address) => self.evict(&address),
            Event::Seed(devices) => self.seed(devices),
            Event::Resync(devices) => self.resync(devices),
            Event::DiscoveryFinished => self.discovering = false,
            Event::AgentRegistered(registered) => self.agent_registered = registered,
            Event::PromptFinished { id, answer } => self.on_prompt_finished(id, answer),
            Event::Shutdown => {}
        }
    }

    fn on_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::Added(address, update) | StackEvent::Changed(address, update) => {
                self.apply(&address, update)
            }
            StackEvent::Removed(address) => {
                self.forget_auth(&address, "device removed by BlueZ");
                self.evict(&address);
            }
            StackEvent::StackLost => {
                warn!("BlueZ left the bus");
                self.cancel_all("bluetooth service went away");
                self.agent_registered = false;
            }
            StackEvent::StackRestarted => {
                info!("BlueZ appeared on the bus, re-registering agent");
                self.register_agent();
                let stack = self.stack.clone();
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    match stack.devices().await {
                        Ok(devices) => handle.send(Event::Resync(devices)),
                        Err(e) => warn!("Failed to resync devices: {}", e),
                    }
                });
            }
        }
    }

    // ---- device cache ----

    fn apply(&mut self, address: &Address, update: DeviceUpdate) {
        if self.cache.upsert(address, update) {
            if let Some(device) = self.cache.get(address) {
                debug!("Device {} changed", address);
                self.broadcaster.publish(&DeviceEvent::Changed {
                    device: device.clone(),
                });
            }
        }
    }

    fn evict(&mut self, address: &Address) {
        if self.cache.remove(address) {
            info!("Device {} removed", address);
            self.broadcaster.publish(&DeviceEvent::Removed {
                address: address.clone(),
            });
        }
    }

    fn resync(&mut self, devices: Vec<(Address, DeviceUpdate)>) {
        for address in self.cache.addresses() {
            if !devices.iter().any(|(present, _)| *present == address) {
                self.evict(&address);
            }
        }
        self.seed(devices);
    }

    fn label(&self, address: &Address) -> String {
        self.cache
            .get(address)
            .map(|device| device.label())
            .unwrap_or_else(|| address.to_string())
    }

    // ---- commands ----

    fn on_request(&mut self, request: Request, reply: oneshot::Sender<Response>) {
        match request {
            Request::DiscoverDevices => {
                respond(reply, Response::Devices { devices: self.cache.list() });
                self.start_discovery();
            }
            Request::PairConnDevice { address } => self.pair_and_connect(&address, reply),
            Request::DeviceState { address } => {
                let response = match address.parse::<Address>() {
                    Ok(address) => match self.cache.get(&address) {
                        Some(device) => Response::Device { device: device.clone() },
                        None => Response::error(BtError::NotFound),
                    },
                    Err(e) => Response::error(e),
                };
                respond(reply, response);
            }
            Request::DisconnectDevice { address } => self.disconnect(&address, reply),
            Request::RemoveDevice { address } => self.remove(&address, reply),
            Request::SendFile { address, path } => self.send_file(&address, path, reply),
            Request::Status => {
                let status = DaemonStatus {
                    devices: self.cache.len(),
                    subscribers: self.broadcaster.len(),
                    discovering: self.discovering,
                    agent_registered: self.agent_registered,
                    pending_authentication: self.pending_addresses(),
                };
                respond(reply, Response::Status { status });
            }
        }
    }

    fn start_discovery(&mut self) {
        if self.discovering {
            debug!("Discovery window already open");
            return;
        }
        self.discovering = true;

        let stack = self.stack.clone();
        let handle = self.handle.clone();
        let window = self.discovery_window;
        tokio::spawn(async move {
            match stack.devices().await {
                Ok(devices) => handle.send(Event::Seed(devices)),
                Err(e) => warn!("Failed to list known devices: {}", e),
            }
            if let Err(e) = stack.discover(window).await {
                warn!("Discovery failed: {}", e);
            }
            handle.send(Event::DiscoveryFinished);
        });
    }

    fn pair_and_connect(&mut self, address: &str, reply: oneshot::Sender<Response>) {
        let address = match address.parse::<Address>() {
            Ok(address) => address,
            Err(e) => return respond(reply, Response::error(e)),
        };

        let progress = self
            .cache
            .get(&address)
            .map(|device| Progress {
                paired: device.paired,
                trusted: device.trusted,
                connected: device.connected,
            })
            .unwrap_or_default();
        if progress.paired && progress.trusted && progress.connected {
            return respond(reply, Response::success(format!("{} already connected", self.label(&address))));
        }

        let stack = self.stack.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let response = pair_trust_connect(&*stack, &handle, &address, progress).await;
            respond(reply, response);
        });
    }

    fn disconnect(&mut self, address: &str, reply: oneshot::Sender<Response>) {
        let address = match address.parse::<Address>() {
            Ok(address) => address,
            Err(e) => return respond(reply, Response::error(e)),
        };

        let stack = self.stack.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let response = match stack.disconnect(&address).await {
                Ok(()) => {
                    handle.apply(&address, DeviceUpdate { connected: Some(false), ..Default::default() });
                    Response::success(format!("{} disconnected", address))
                }
                Err(e) => Response::error(e),
            };
            respond(reply, response);
        });
    }

    fn remove(&mut self, address: &str, reply: oneshot::Sender<Response>) {
        let address = match address.parse::<Address>() {
            Ok(address) => address,
            Err(e) => return respond(reply, Response::error(e)),
        };
        self.forget_auth(&address, "device being removed");

        let stack = self.stack.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let response = match stack.remove(&address).await {
                Ok(()) => {
                    handle.send(Event::Evict(address.clone()));
                    Response::success(format!("{} removed from known devices", address))
                }
                Err(e) => Response::error(e),
            };
            respond(reply, response);
        });
    }

    fn send_file(&mut self, address: &str, path: std::path::PathBuf, reply: oneshot::Sender<Response>) {
        let address = match address.parse::<Address>() {
            Ok(address) => address,
            Err(e) => return respond(reply, Response::error(e)),
        };
        if self.cache.get(&address).is_none() {
            return respond(reply, Response::error(BtError::NotFound));
        }

        let stack = self.stack.clone();
        tokio::spawn(async move {
            let response = match stack.send_file(&address, &path).await {
                Ok(()) => Response::success(format!("{} queued for {}", path.display(), address)),
                Err(e) => Response::error(e),
            };
            respond(reply, response);
        });
    }

    // ---- authentication ----

    fn register_agent(&self) {
        let stack = self.stack.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let registered = match stack.register_agent().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Agent registration failed: {}", e);
                    false
                }
            };
            handle.send(Event::AgentRegistered(registered));
        });
    }

    fn ask(&self, prompt: Prompt, cancel: CancelSignal) -> Uuid {
        let id = Uuid::new_v4();
        let prompter = self.prompter.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let answer = prompter.ask(prompt, cancel).await;
            handle.send(Event::PromptFinished { id, answer });
        });
        id
    }

    fn on_auth_request(&mut self, request: AuthRequest) {
        let AuthRequest { address, kind, reply } = request;

        if kind.is_display() {
            let _ = reply.send(Ok(AuthAnswer::Accepted));
            self.show(address, kind);
            return;
        }

        if let Some(live) = &self.auth {
            warn!(
                "Rejecting {:?} for {}: request for {} still pending",
                kind, address, live.address
            );
            let _ = reply.send(Err(BtError::Busy));
            return;
        }

        info!("Authentication {:?} requested for {}", kind, address);
        let (cancel, signal) = oneshot::channel();
        let id = self.ask(kind.prompt(&self.label(&address)), signal);
        self.mark_pending(&address, true);
        self.auth = Some(PendingAuth {
            id,
            address,
            kind,
            reply,
            _cancel: cancel,
        });
    }

    /// Devices only enter the cache through the stack or a command, so an
    /// unknown address is tracked in `auth` alone.
    fn mark_pending(&mut self, address: &Address, pending: bool) {
        if self.cache.get(address).is_some() {
            self.apply(address, DeviceUpdate { pending_authentication: Some(pending), ..Default::default() });
        }
    }

    /// Shows an informational code; repeats of the same code keep the open prompt.
    fn show(&mut self, address: Address, kind: AuthKind) {
        if self.displays.get(&address).is_some_and(|shown| shown.kind == kind) {
            return;
        }
        let (cancel, signal) = oneshot::channel();
        let id = self.ask(kind.prompt(&self.label(&address)), signal);
        self.displays.insert(address, DisplayPrompt { id, kind, _cancel: cancel });
    }

    fn on_prompt_finished(&mut self, id: Uuid, answer: Answer) {
        let auth = match self.auth.take() {
            Some(auth) if auth.id == id => auth,
            other => {
                // informational, or a prompt whose request was already torn down
                self.auth = other;
                self.displays.retain(|_, shown| shown.id != id);
                return;
            }
        };

        let result = resolve(&auth.kind, answer);
        match &result {
            Ok(_) => info!("Authentication for {} accepted", auth.address),
            Err(e) => info!("Authentication for {} refused: {}", auth.address, e),
        }
        let _ = auth.reply.send(result);
        self.mark_pending(&auth.address, false);
    }

    /// Rejects the live request, if any, and frees its device.
    fn cancel_live(&mut self, reason: &str) {
        if let Some(auth) = self.auth.take() {
            info!("Authentication for {} torn down: {}", auth.address, reason);
            let _ = auth.reply.send(Err(BtError::Rejected));
            self.mark_pending(&auth.address, false);
        }
    }

    fn cancel_all(&mut self, reason: &str) {
        self.cancel_live(reason);
        self.displays.clear();
    }

    fn forget_auth(&mut self, address: &Address, reason: &str) {
        if self.auth.as_ref().is_some_and(|auth| &auth.address == address) {
            self.cancel_live(reason);
        }
        self.displays.remove(address);
    }

    fn pending_addresses(&self) -> Vec<Address> {
        self.auth.iter().map(|auth| auth.address.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    paired: bool,
    trusted: bool,
    connected: bool,
}

/// pair → trust → connect, skipping stages already done. Stops at the first
/// failure; completed stages stay applied.
async fn pair_trust_connect<S: BluetoothStack>(
    stack: &S,
    handle: &Handle,
    address: &Address,
    progress: Progress,
) -> Response {
    if !progress.paired {
        match stack.pair(address).await {
            Ok(()) | Err(BtError::AlreadyExists) => {
                handle.apply(address, DeviceUpdate { paired: Some(true), ..Default::default() })
            }
            Err(e) => return Response::stage_error(Stage::Pair, e),
        }
    }
    if !progress.trusted {
        match stack.trust(address).await {
            Ok(()) => handle.apply(address, DeviceUpdate { trusted: Some(true), ..Default::default() }),
            Err(e) => return Response::stage_error(Stage::Trust, e),
        }
    }
    if !progress.connected {
        match stack.connect(address).await {
            Ok(()) | Err(BtError::AlreadyExists) => {
                handle.apply(address, DeviceUpdate { connected: Some(true), ..Default::default() })
            }
            Err(e) => return Response::stage_error(Stage::Connect, e),
        }
    }
    Response::success(format!("Connected to {}", address))
}

/// Turns the human's answer into the value BlueZ expects for `kind`.
fn resolve(kind: &AuthKind, answer: Answer) -> Result<AuthAnswer, BtError> {
    match (kind, answer) {
        (AuthKind::PinCode, Answer::Text(pin)) => {
            let pin = pin.trim();
            if (1..=16).contains(&pin.chars().count()) {
                Ok(AuthAnswer::PinCode(pin.to_string()))
            } else {
                Err(BtError::Rejected)
            }
        }
        (AuthKind::Passkey, Answer::Text(text)) => match text.trim().parse::<u32>() {
            Ok(passkey) if passkey < 1_000_000 => Ok(AuthAnswer::Passkey(passkey)),
            _ => Err(BtError::Rejected),
        },
        (AuthKind::PinCode | AuthKind::Passkey, _) => Err(BtError::Rejected),
        (_, Answer::Confirmed(true)) => Ok(AuthAnswer::Accepted),
        _ => Err(BtError::Rejected),
    }
}
