/*!
 * Bluetooth Stack Adapter
 * BlueZ over D-Bus, pinned to a single adapter
 */

use dbus::arg::{prop_cast, PropMap, Variant};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Path;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{AGENT_CAPABILITY, AGENT_PATH};
use crate::device::{Address, DeviceUpdate};
use crate::error::BtError;

pub const BLUEZ_DBUS: &str = "org.bluez";
pub const ADAPTER_PATH: &str = "/org/bluez/hci0";

pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";

pub const OBEX_DBUS: &str = "org.bluez.obex";
pub const OBEX_PATH: &str = "/org/bluez/obex";
const OBEX_CLIENT_INTERFACE: &str = "org.bluez.obex.Client1";
const OBEX_PUSH_INTERFACE: &str = "org.bluez.obex.ObjectPush1";

// Pair waits on a human, so this has to outlast the prompt.
const DBUS_TIMEOUT: Duration = Duration::from_secs(60);

/// Device-level notifications for the fixed adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    Added(Address, DeviceUpdate),
    Changed(Address, DeviceUpdate),
    Removed(Address),
    /// `org.bluez` left the bus.
    StackLost,
    /// `org.bluez` (re)appeared on the bus.
    StackRestarted,
}

/// Operations the daemon issues against the Bluetooth stack.
pub trait BluetoothStack: Send + Sync + 'static {
    /// Current devices of the adapter.
    fn devices(&self) -> impl Future<Output = Result<Vec<(Address, DeviceUpdate)>, BtError>> + Send;
    /// Opens a discovery window; results arrive as `StackEvent`s.
    fn discover(&self, window: Duration) -> impl Future<Output = Result<(), BtError>> + Send;
    fn pair(&self, address: &Address) -> impl Future<Output = Result<(), BtError>> + Send;
    fn trust(&self, address: &Address) -> impl Future<Output = Result<(), BtError>> + Send;
    fn connect(&self, address: &Address) -> impl Future<Output = Result<(), BtError>> + Send;
    fn disconnect(&self, address: &Address) -> impl Future<Output = Result<(), BtError>> + Send;
    fn remove(&self, address: &Address) -> impl Future<Output = Result<(), BtError>> + Send;
    fn send_file(
        &self,
        address: &Address,
        file: &std::path::Path,
    ) -> impl Future<Output = Result<(), BtError>> + Send;
    /// Registers our agent object as the default pairing agent.
    fn register_agent(&self) -> impl Future<Output = Result<(), BtError>> + Send;
}

pub fn device_path(address: &Address) -> Path<'static> {
    Path::from(format!("{}/{}", ADAPTER_PATH, address.path_segment()))
}

/// Address of a device object directly under the fixed adapter.
/// Objects of other adapters and per-service child objects yield `None`.
pub fn address_from_path(path: &str) -> Option<Address> {
    let segment = path.strip_prefix(ADAPTER_PATH)?.strip_prefix("/dev_")?;
    if segment.contains('/') {
        return None;
    }
    segment.replace('_', ":").parse().ok()
}

/// Translates `org.bluez.Device1` properties into a partial update.
pub fn device_update(props: &PropMap) -> DeviceUpdate {
    DeviceUpdate {
        name: prop_cast::<String>(props, "Alias")
            .or_else(|| prop_cast::<String>(props, "Name"))
            .cloned(),
        icon: prop_cast::<String>(props, "Icon").cloned(),
        discovered: None,
        paired: prop_cast::<bool>(props, "Paired").copied(),
        trusted: prop_cast::<bool>(props, "Trusted").copied(),
        connected: prop_cast::<bool>(props, "Connected").copied(),
        rssi: props
            .get("RSSI")
            .and_then(|v| v.0.as_i64())
            .and_then(|v| i16::try_from(v).ok()),
        uuids: props.get("UUIDs").and_then(|v| {
            v.0.as_iter()
                .map(|items| items.filter_map(|s| s.as_str().map(str::to_owned)).collect())
        }),
        pending_authentication: None,
    }
}

fn added_event(path: &Path<'_>, interfaces: &HashMap<String, PropMap>) -> Option<StackEvent> {
    let props = interfaces.get(DEVICE_INTERFACE)?;
    let address = address_from_path(path)?;
    let mut update = device_update(props);
    update.discovered = Some(true);
    Some(StackEvent::Added(address, update))
}

fn removed_event(path: &Path<'_>, interfaces: &[String]) -> Option<StackEvent> {
    if !interfaces.iter().any(|i| i == DEVICE_INTERFACE) {
        return None;
    }
    address_from_path(path).map(StackEvent::Removed)
}

fn owner_event(name: &str, new_owner: &str) -> Option<StackEvent> {
    if name != BLUEZ_DBUS {
        return None;
    }
    Some(if new_owner.is_empty() {
        StackEvent::StackLost
    } else {
        StackEvent::StackRestarted
    })
}

/// Signal subscriptions backing a device-event stream.
pub struct Watch {
    conn: Arc<SyncConnection>,
    matches: Vec<MsgMatch>,
}

impl Watch {
    pub async fn stop(self) {
        for m in self.matches {
            if let Err(e) = self.conn.remove_match(m.token()).await {
                debug!("Failed to remove signal match: {}", e);
            }
        }
    }
}

#[derive(Clone)]
pub struct BluezStack {
    conn: Arc<SyncConnection>,
    // obexd lives on the session bus
    session: Option<Arc<SyncConnection>>,
}

impl BluezStack {
    pub fn new(conn: Arc<SyncConnection>, session: Option<Arc<SyncConnection>>) -> Self {
        Self { conn, session }
    }

    fn proxy<'a>(&self, path: impl Into<Path<'a>>) -> Proxy<'a, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_DBUS, path, DBUS_TIMEOUT, self.conn.clone())
    }

    fn device_proxy(&self, address: &Address) -> Proxy<'static, Arc<SyncConnection>> {
        self.proxy(device_path(address))
    }

    /// Subscribes to device and stack lifecycle signals. The returned receiver
    /// yields events for as long as the `Watch` is kept alive.
    pub async fn watch(&self) -> Result<(Watch, mpsc::UnboundedReceiver<StackEvent>), BtError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut matches = Vec::new();

        let events = tx.clone();
        let rule = MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesAdded")
            .with_sender(BLUEZ_DBUS);
        matches.push(self.conn.add_match(rule).await?.cb(
            move |_, (path, interfaces): (Path<'static>, HashMap<String, PropMap>)| {
                if let Some(event) = added_event(&path, &interfaces) {
                    let _ = events.send(event);
                }
                true
            },
        ));

        let events = tx.clone();
        let rule = MatchRule::new_signal("org.freedesktop.DBus.ObjectManager", "InterfacesRemoved")
            .with_sender(BLUEZ_DBUS);
        matches.push(self.conn.add_match(rule).await?.cb(
            move |_, (path, interfaces): (Path<'static>, Vec<String>)| {
                if let Some(event) = removed_event(&path, &interfaces) {
                    let _ = events.send(event);
                }
                true
            },
        ));

        let events = tx.clone();
        let rule = MatchRule::new_signal("org.freedesktop.DBus.Properties", "PropertiesChanged")
            .with_sender(BLUEZ_DBUS);
        matches.push(self.conn.add_match(rule).await?.cb(
            move |msg, (interface, changed, _invalidated): (String, PropMap, Vec<String>)| {
                if interface != DEVICE_INTERFACE {
                    return true;
                }
                if let Some(address) = msg.path().and_then(|p| address_from_path(&p)) {
                    let _ = events.send(StackEvent::Changed(address, device_update(&changed)));
                }
                true
            },
        ));

        let events = tx;
        let rule = MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged")
            .with_sender("org.freedesktop.DBus");
        matches.push(self.conn.add_match(rule).await?.cb(
            move |_, (name, _old, new): (String, String, String)| {
                if let Some(event) = owner_event(&name, &new) {
                    let _ = events.send(event);
                }
                true
            },
        ));

        info!("Watching devices on {}", ADAPTER_PATH);
        Ok((
            Watch {
                conn: self.conn.clone(),
                matches,
            },
            rx,
        ))
    }

    pub async fn unregister_agent(&self) -> Result<(), BtError> {
        let reply: Result<(), dbus::Error> = self
            .proxy("/org/bluez")
            .method_call(AGENT_MANAGER_INTERFACE, "UnregisterAgent", (Path::from(AGENT_PATH),))
            .await;
        reply.map_err(BtError::from)
    }
}

impl BluetoothStack for BluezStack {
    async fn devices(&self) -> Result<Vec<(Address, DeviceUpdate)>, BtError> {
        let objects = self.proxy("/").get_managed_objects().await?;
        let mut devices: Vec<(Address, DeviceUpdate)> = objects
            .iter()
            .filter_map(|(path, interfaces)| match added_event(path, interfaces) {
                Some(StackEvent::Added(address, update)) => Some((address, update)),
                _ => None,
            })
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(devices)
    }

    async fn discover(&self, window: Duration) -> Result<(), BtError> {
        let adapter = self.proxy(ADAPTER_PATH);
        let started: Result<(), dbus::Error> =
            adapter.method_call(ADAPTER_INTERFACE, "StartDiscovery", ()).await;
        if let Err(e) = started {
            // another client already holds a discovery session
            if e.name() != Some("org.bluez.Error.InProgress") {
                return Err(e.into());
            }
        }
        info!("Discovery started for {}s", window.as_secs());

        tokio::time::sleep(window).await;

        let stopped: Result<(), dbus::Error> =
            adapter.method_call(ADAPTER_INTERFACE, "StopDiscovery", ()).await;
        if let Err(e) = stopped {
            debug!("StopDiscovery: {}", e);
        }
        info!("Discovery stopped");
        Ok(())
    }

    async fn pair(&self, address: &Address) -> Result<(), BtError> {
        debug!("Pairing with {}", address);
        let reply: Result<(), dbus::Error> = self
            .device_proxy(address)
            .method_call(DEVICE_INTERFACE, "Pair", ())
            .await;
        reply.map_err(BtError::from)
    }

    async fn trust(&self, address: &Address) -> Result<(), BtError> {
        debug!("Trusting {}", address);
        self.device_proxy(address)
            .set(DEVICE_INTERFACE, "Trusted", true)
            .await
            .map_err(BtError::from)
    }

    async fn connect(&self, address: &Address) -> Result<(), BtError> {
        debug!("Connecting to {}", address);
        let reply: Result<(), dbus::Error> = self
            .device_proxy(address)
            .method_call(DEVICE_INTERFACE, "Connect", ())
            .await;
        reply.map_err(BtError::from)
    }

    async fn disconnect(&self, address: &Address) -> Result<(), BtError> {
        debug!("Disconnecting {}", address);
        let reply: Result<(), dbus::Error> = self
            .device_proxy(address)
            .method_call(DEVICE_INTERFACE, "Disconnect", ())
            .await;
        reply.map_err(BtError::from)
    }

    async fn remove(&self, address: &Address) -> Result<(), BtError> {
        debug!("Removing {}", address);
        let reply: Result<(), dbus::Error> = self
            .proxy(ADAPTER_PATH)
            .method_call(ADAPTER_INTERFACE, "RemoveDevice", (device_path(address),))
            .await;
        reply.map_err(BtError::from)
    }

    async fn send_file(&self, address: &Address, file: &std::path::Path) -> Result<(), BtError> {
        let session_bus = self.session.clone().ok_or(BtError::StackUnavailable)?;
        let client = Proxy::new(OBEX_DBUS, OBEX_PATH, DBUS_TIMEOUT, session_bus.clone());

        let mut args: PropMap = HashMap::new();
        args.insert("Target".to_string(), Variant(Box::new("opp".to_string())));
        let (session,): (Path<'static>,) = client
            .method_call(OBEX_CLIENT_INTERFACE, "CreateSession", (address.as_str(), args))
            .await?;

        let pushed: Result<(Path<'static>, PropMap), dbus::Error> =
            Proxy::new(OBEX_DBUS, session.clone(), DBUS_TIMEOUT, session_bus)
                .method_call(
                    OBEX_PUSH_INTERFACE,
                    "SendFile",
                    (file.to_string_lossy().into_owned(),),
                )
                .await;

        match pushed {
            Ok((transfer, _)) => {
                info!("Queued {} for {} as {}", file.display(), address, transfer);
                Ok(())
            }
            Err(e) => {
                let closed: Result<(), dbus::Error> = client
                    .method_call(OBEX_CLIENT_INTERFACE, "RemoveSession", (session,))
                    .await;
                if let Err(close_err) = closed {
                    debug!("RemoveSession: {}", close_err);
                }
                Err(e.into())
            }
        }
    }

    async fn register_agent(&self) -> Result<(), BtError> {
        let manager = self.proxy("/org/bluez");
        let registered: Result<(), dbus::Error> = manager
            .method_call(
                AGENT_MANAGER_INTERFACE,
                "RegisterAgent",
                (Path::from(AGENT_PATH), AGENT_CAPABILITY),
            )
            .await;
        match registered {
            Ok(()) => {}
            Err(e) if e.name() == Some("org.bluez.Error.AlreadyExists") => {
                debug!("Agent already registered");
            }
            Err(e) => {
                warn!("RegisterAgent failed: {}", e);
                return Err(e.into());
            }
        }
        let made_default: Result<(), dbus::Error> = manager
            .method_call(AGENT_MANAGER_INTERFACE, "RequestDefaultAgent", (Path::from(AGENT_PATH),))
            .await;
        made_default.map_err(BtError::from)?;
        info!("Agent registered at {} ({})", AGENT_PATH, AGENT_CAPABILITY);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus::arg::RefArg;

    fn variant<T: RefArg + 'static>(value: T) -> Variant<Box<dyn RefArg>> {
        Variant(Box::new(value))
    }

    #[test]
    fn paths_round_trip_for_fixed_adapter() {
        let address: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let path = device_path(&address);
        assert_eq!(&*path, "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert_eq!(address_from_path(&path), Some(address));
    }

    #[test]
    fn ignores_other_adapters_and_child_objects() {
        assert_eq!(address_from_path("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_FF"), None);
        assert_eq!(address_from_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1"), None);
        assert_eq!(address_from_path("/org/bluez/hci0"), None);
    }

    #[test]
    fn translates_device_properties() {
        let mut props: PropMap = HashMap::new();
        props.insert("Address".into(), variant("AA:BB:CC:DD:EE:FF".to_string()));
        props.insert("Name".into(), variant("WH-1000".to_string()));
        props.insert("Alias".into(), variant("My Headphones".to_string()));
        props.insert("Paired".into(), variant(true));
        props.insert("Connected".into(), variant(false));
        props.insert("RSSI".into(), variant(-60i16));
        props.insert(
            "UUIDs".into(),
            variant(vec!["0000110b-0000-1000-8000-00805f9b34fb".to_string()]),
        );

        let update = device_update(&props);
        assert_eq!(update.name.as_deref(), Some("My Headphones"));
        assert_eq!(update.paired, Some(true));
        assert_eq!(update.connected, Some(false));
        assert_eq!(update.trusted, None);
        assert_eq!(update.rssi, Some(-60));
        assert_eq!(update.uuids.map(|u| u.len()), Some(1));
    }

    #[test]
    fn interfaces_added_marks_discovered() {
        let mut interfaces = HashMap::new();
        let mut props: PropMap = HashMap::new();
        props.insert("Paired".into(), variant(false));
        interfaces.insert(DEVICE_INTERFACE.to_string(), props);

        let path = Path::from("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        match added_event(&path, &interfaces) {
            Some(StackEvent::Added(address, update)) => {
                assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
                assert_eq!(update.discovered, Some(true));
                assert_eq!(update.paired, Some(false));
            }
            other => panic!("unexpected {:?}", other),
        }

        interfaces.clear();
        interfaces.insert(ADAPTER_INTERFACE.to_string(), HashMap::new());
        assert!(added_event(&path, &interfaces).is_none());
    }

    #[test]
    fn interfaces_removed_needs_device_interface() {
        let path = Path::from("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert!(removed_event(&path, &["org.bluez.MediaControl1".to_string()]).is_none());
        assert!(matches!(
            removed_event(&path, &[DEVICE_INTERFACE.to_string()]),
            Some(StackEvent::Removed(_))
        ));
    }

    #[test]
    fn bluez_owner_changes() {
        assert_eq!(owner_event("org.bluez", ""), Some(StackEvent::StackLost));
        assert_eq!(owner_event("org.bluez", ":1.42"), Some(StackEvent::StackRestarted));
        assert_eq!(owner_event("org.freedesktop.NetworkManager", ""), None);
    }
}
