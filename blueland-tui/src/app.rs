use tokio::sync::mpsc;

use crate::client::{BluelandClient, DaemonStatus, Device, DeviceEvent, Request, Response};

/// Everything that can change the app from outside the key loop.
#[derive(Debug)]
pub enum Update {
    Event(DeviceEvent),
    Reply {
        action: Action,
        result: Result<Response, String>,
    },
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Discover,
    PairConnect,
    Disconnect,
    Remove,
    Status,
}

impl Action {
    fn label(&self) -> &'static str {
        match self {
            Action::Discover => "Discovery",
            Action::PairConnect => "Pair and connect",
            Action::Disconnect => "Disconnect",
            Action::Remove => "Remove",
            Action::Status => "Status",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusLine {
    Info(String),
    Error(String),
}

pub struct App {
    pub devices: Vec<Device>,
    pub selected_device: usize,
    pub status: StatusLine,
    pub daemon: Option<DaemonStatus>,
    pub events_live: bool,
    pub pending: usize,
    client: BluelandClient,
    updates: mpsc::UnboundedSender<Update>,
}

impl App {
    pub fn new(client: BluelandClient, updates: mpsc::UnboundedSender<Update>) -> Self {
        Self {
            devices: Vec::new(),
            selected_device: 0,
            status: StatusLine::Info("Connecting to bluelandd...".to_string()),
            daemon: None,
            events_live: true,
            pending: 0,
            client,
            updates,
        }
    }

    pub fn previous_device(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device = if self.selected_device == 0 {
                self.devices.len() - 1
            } else {
                self.selected_device - 1
            };
        }
    }

    pub fn next_device(&mut self) {
        if !self.devices.is_empty() {
            self.selected_device = (self.selected_device + 1) % self.devices.len();
        }
    }

    pub fn get_selected_device(&self) -> Option<&Device> {
        self.devices.get(self.selected_device)
    }

    pub fn discover(&mut self) {
        self.send(Action::Discover, Request::DiscoverDevices);
    }

    pub fn pair_connect(&mut self) {
        if let Some(address) = self.selected_address() {
            self.send(Action::PairConnect, Request::PairConnDevice { address });
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(address) = self.selected_address() {
            self.send(Action::Disconnect, Request::DisconnectDevice { address });
        }
    }

    pub fn remove(&mut self) {
        if let Some(address) = self.selected_address() {
            self.send(Action::Remove, Request::RemoveDevice { address });
        }
    }

    /// Refreshes the header without touching the status line.
    pub fn refresh_status(&mut self) {
        self.send(Action::Status, Request::Status);
    }

    fn selected_address(&mut self) -> Option<String> {
        let address = self.get_selected_device().map(|device| device.address.clone());
        if address.is_none() {
            self.status = StatusLine::Error("No device selected".to_string());
        }
        address
    }

    fn send(&mut self, action: Action, request: Request) {
        if action != Action::Status {
            self.pending += 1;
            self.status = StatusLine::Info(format!("{}...", action.label()));
        }

        let client = self.client.clone();
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let result = client
                .send_request(&request)
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = updates.send(Update::Reply { action, result });
        });
    }

    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Event(event) => self.apply_event(event),
            Update::Reply { action, result } => self.apply_reply(action, result),
            Update::Disconnected(reason) => {
                self.events_live = false;
                self.status = StatusLine::Error(reason);
            }
        }
    }

    pub fn apply_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Changed { device } => self.upsert(device),
            DeviceEvent::Removed { address } => {
                self.devices.retain(|device| device.address != address);
                if self.selected_device >= self.devices.len() {
                    self.selected_device = self.devices.len().saturating_sub(1);
                }
            }
        }
    }

    fn upsert(&mut self, device: Device) {
        match self.devices.iter_mut().find(|known| known.address == device.address) {
            Some(known) => *known = device,
            None => self.devices.push(device),
        }
    }

    fn apply_reply(&mut self, action: Action, result: Result<Response, String>) {
        if action == Action::Status {
            match result {
                Ok(Response::Status { status }) => self.daemon = Some(status),
                _ => self.daemon = None,
            }
            return;
        }

        self.pending = self.pending.saturating_sub(1);
        self.status = match result {
            Err(e) => StatusLine::Error(format!("{} failed: {}", action.label(), e)),
            Ok(Response::Devices { devices }) => {
                let count = devices.len();
                for device in devices {
                    self.upsert(device);
                }
                StatusLine::Info(format!("Scanning, {} devices known", count))
            }
            Ok(Response::Device { device }) => {
                let message = format!("{} updated", device.display_name());
                self.upsert(device);
                StatusLine::Info(message)
            }
            Ok(Response::Success { message }) => StatusLine::Info(message),
            Ok(Response::Status { .. }) => StatusLine::Info("Daemon status updated".to_string()),
            Ok(Response::Error { error, stage, .. }) => StatusLine::Error(match stage {
                Some(stage) => format!("{} failed at {}: {}", action.label(), stage, error),
                None => format!("{} failed: {}", action.label(), error),
            }),
        };
    }
}
