/*!
 * Pairing Agent
 * org.bluez.Agent1 exported on the system bus; every callback is
 * forwarded to the coordinator and answered from its reply
 */

use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::SyncConnection;
use dbus::{MethodErr, Path};
use dbus_crossroads::{Context, Crossroads, IfaceBuilder, IfaceToken};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bluez::address_from_path;
use crate::coordinator::Handle;
use crate::error::BtError;
use crate::prompt::{Prompt, PromptKind};

pub const AGENT_PATH: &str = "/org/bluez/Blueland/Agent";
pub const AGENT_CAPABILITY: &str = "KeyboardDisplay";

const AGENT_INTERFACE: &str = "org.bluez.Agent1";
const BLUEZ_REJECTED_ERROR: &str = "org.bluez.Error.Rejected";
const BLUEZ_CANCELED_ERROR: &str = "org.bluez.Error.Canceled";

const UUID_NAMES: &[(&str, &str)] = &[
    ("0000111e-0000-1000-8000-00805f9b34fb", "Hands-Free Profile (Calls)"),
    ("0000110d-0000-1000-8000-00805f9b34fb", "A2DP Sink (Media Audio)"),
    ("0000110e-0000-1000-8000-00805f9b34fb", "AVRCP Controller (Media Controls)"),
];

/// What the stack is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthKind {
    PinCode,
    DisplayPinCode(String),
    Passkey,
    DisplayPasskey(u32),
    Confirmation(u32),
    Authorization,
    ServiceAuthorization(String),
}

impl AuthKind {
    /// Display kinds are informational; the stack gets its reply right away.
    pub fn is_display(&self) -> bool {
        matches!(self, AuthKind::DisplayPinCode(_) | AuthKind::DisplayPasskey(_))
    }

    pub fn prompt(&self, device: &str) -> Prompt {
        match self {
            AuthKind::PinCode => Prompt::new(
                PromptKind::TextEntry,
                format!("Enter the PIN code for {device} (1-16 characters)"),
            ),
            AuthKind::Passkey => Prompt::new(
                PromptKind::TextEntry,
                format!("Enter the passkey shown on {device} (6 digits)"),
            ),
            AuthKind::DisplayPinCode(pin) => {
                Prompt::new(PromptKind::Info, format!("Enter this PIN code on {device}"))
                    .with_payload(pin.clone())
            }
            AuthKind::DisplayPasskey(passkey) => {
                Prompt::new(PromptKind::Info, format!("Enter this passkey on {device}"))
                    .with_payload(format!("{passkey:06}"))
            }
            AuthKind::Confirmation(passkey) => Prompt::new(
                PromptKind::YesNo,
                format!("Confirm pairing with {device} using passkey"),
            )
            .with_payload(format!("{passkey:06}")),
            AuthKind::Authorization => {
                Prompt::new(PromptKind::YesNo, format!("Allow {device} to pair?"))
            }
            AuthKind::ServiceAuthorization(uuid) => Prompt::new(
                PromptKind::YesNo,
                format!("Allow {device} to use:\n{}", service_name(uuid)),
            ),
        }
    }
}

pub fn service_name(uuid: &str) -> String {
    let uuid = uuid.to_ascii_lowercase();
    UUID_NAMES
        .iter()
        .find(|(known, _)| *known == uuid)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("Unknown Service ({uuid})"))
}

/// Value returned to the stack for an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAnswer {
    Accepted,
    PinCode(String),
    Passkey(u32),
}

#[derive(Debug)]
pub enum AgentEvent {
    Request(AuthRequest),
    /// The stack gave up on the in-flight request.
    Cancel,
    /// The stack dropped our registration.
    Released,
}

#[derive(Debug)]
pub struct AuthRequest {
    pub address: crate::device::Address,
    pub kind: AuthKind,
    pub reply: tokio::sync::oneshot::Sender<Result<AuthAnswer, BtError>>,
}

fn method_err(err: BtError) -> MethodErr {
    let name = match err {
        BtError::Rejected | BtError::Busy => BLUEZ_REJECTED_ERROR,
        _ => BLUEZ_CANCELED_ERROR,
    };
    dbus::Error::new_custom(name, &err.to_string()).into()
}

fn forward(
    cr: &mut Crossroads,
    ctx: &Context,
    device: Path<'static>,
    kind: AuthKind,
) -> impl Future<Output = Result<AuthAnswer, MethodErr>> + Send + 'static {
    let handle = cr.data_mut::<Handle>(ctx.path()).cloned();
    async move {
        let handle = handle.ok_or_else(|| MethodErr::no_path(&Path::from(AGENT_PATH)))?;
        // devices of other adapters are not ours to answer for
        let address = address_from_path(&device).ok_or_else(|| method_err(BtError::Rejected))?;
        debug!("{:?} for {}", kind, address);
        handle.authenticate(address, kind).await.map_err(method_err)
    }
}

fn register_interface(cr: &mut Crossroads) -> IfaceToken<Handle> {
    cr.register(AGENT_INTERFACE, |b: &mut IfaceBuilder<Handle>| {
        b.method("Release", (), (), |_, handle, ()| {
            info!("Agent released by BlueZ");
            handle.agent(AgentEvent::Released);
            Ok(())
        });
        b.method("Cancel", (), (), |_, handle, ()| {
            info!("Pairing cancelled by BlueZ");
            handle.agent(AgentEvent::Cancel);
            Ok(())
        });
        b.method_with_cr_async(
            "RequestPinCode",
            ("device",),
            ("pincode",),
            |mut ctx, cr, (device,): (Path<'static>,)| {
                let answer = forward(cr, &ctx, device, AuthKind::PinCode);
                async move {
                    let reply = match answer.await {
                        Ok(AuthAnswer::PinCode(pin)) => Ok((pin,)),
                        Ok(_) => Err(method_err(BtError::Rejected)),
                        Err(e) => Err(e),
                    };
                    ctx.reply(reply)
                }
            },
        );
        b.method_with_cr_async(
            "DisplayPinCode",
            ("device", "pincode"),
            (),
            |mut ctx, cr, (device, pincode): (Path<'static>, String)| {
                let answer = forward(cr, &ctx, device, AuthKind::DisplayPinCode(pincode));
                async move { ctx.reply(answer.await.map(|_| ())) }
            },
        );
        b.method_with_cr_async(
            "RequestPasskey",
            ("device",),
            ("passkey",),
            |mut ctx, cr, (device,): (Path<'static>,)| {
                let answer = forward(cr, &ctx, device, AuthKind::Passkey);
                async move {
                    let reply = match answer.await {
                        Ok(AuthAnswer::Passkey(passkey)) => Ok((passkey,)),
                        Ok(_) => Err(method_err(BtError::Rejected)),
                        Err(e) => Err(e),
                    };
                    ctx.reply(reply)
                }
            },
        );
        b.method_with_cr_async(
            "DisplayPasskey",
            ("device", "passkey", "entered"),
            (),
            |mut ctx, cr, (device, passkey, _entered): (Path<'static>, u32, u16)| {
                let answer = forward(cr, &ctx, device, AuthKind::DisplayPasskey(passkey));
                async move { ctx.reply(answer.await.map(|_| ())) }
            },
        );
        b.method_with_cr_async(
            "RequestConfirmation",
            ("device", "passkey"),
            (),
            |mut ctx, cr, (device, passkey): (Path<'static>, u32)| {
                let answer = forward(cr, &ctx, device, AuthKind::Confirmation(passkey));
                async move { ctx.reply(answer.await.map(|_| ())) }
            },
        );
        b.method_with_cr_async(
            "RequestAuthorization",
            ("device",),
            (),
            |mut ctx, cr, (device,): (Path<'static>,)| {
                let answer = forward(cr, &ctx, device, AuthKind::Authorization);
                async move { ctx.reply(answer.await.map(|_| ())) }
            },
        );
        b.method_with_cr_async(
            "AuthorizeService",
            ("device", "uuid"),
            (),
            |mut ctx, cr, (device, uuid): (Path<'static>, String)| {
                let answer = forward(cr, &ctx, device, AuthKind::ServiceAuthorization(uuid));
                async move { ctx.reply(answer.await.map(|_| ())) }
            },
        );
    })
}

/// Exports the agent object on `conn`. Registration with the AgentManager is
/// done separately so it can be repeated after a BlueZ restart.
pub fn serve(conn: &Arc<SyncConnection>, handle: Handle) {
    let mut cr = Crossroads::new();
    cr.set_async_support(Some((
        conn.clone(),
        Box::new(|fut| {
            tokio::spawn(fut);
        }),
    )));
    let token = register_interface(&mut cr);
    cr.insert(AGENT_PATH, &[token], handle);

    conn.start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| {
            if cr.handle_message(msg, conn).is_err() {
                debug!("Unhandled method call on system bus");
            }
            true
        }),
    );
    info!("Agent exported at {}", AGENT_PATH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_prompt_shows_passkey() {
        let prompt = AuthKind::Confirmation(123456).prompt("Headphones (AA:BB:CC:DD:EE:FF)");
        assert_eq!(prompt.kind, PromptKind::YesNo);
        assert_eq!(prompt.payload.as_deref(), Some("123456"));
        assert!(prompt.message.contains("Headphones"));
    }

    #[test]
    fn passkeys_are_zero_padded() {
        let prompt = AuthKind::DisplayPasskey(42).prompt("dev");
        assert_eq!(prompt.kind, PromptKind::Info);
        assert_eq!(prompt.payload.as_deref(), Some("000042"));
    }

    #[test]
    fn entry_kinds_ask_for_text() {
        assert_eq!(AuthKind::PinCode.prompt("dev").kind, PromptKind::TextEntry);
        assert_eq!(AuthKind::Passkey.prompt("dev").kind, PromptKind::TextEntry);
        assert_eq!(AuthKind::Authorization.prompt("dev").kind, PromptKind::YesNo);
    }

    #[test]
    fn names_known_services() {
        assert_eq!(
            service_name("0000110D-0000-1000-8000-00805F9B34FB"),
            "A2DP Sink (Media Audio)"
        );
        assert_eq!(
            service_name("00001234-0000-1000-8000-00805f9b34fb"),
            "Unknown Service (00001234-0000-1000-8000-00805f9b34fb)"
        );
    }

    #[test]
    fn rejections_map_to_bluez_errors() {
        let err: dbus::Error = method_err(BtError::Busy).into();
        assert_eq!(err.name(), Some(BLUEZ_REJECTED_ERROR));
        let err: dbus::Error = method_err(BtError::Timeout).into();
        assert_eq!(err.name(), Some(BLUEZ_CANCELED_ERROR));
    }
}
