/*!
 * OBEX Push Agent
 * Accepts or refuses incoming Object Push transfers on the session bus
 */

use dbus::channel::MatchingReceiver;
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::Properties;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::{MethodErr, Path};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bluez::{OBEX_DBUS, OBEX_PATH};
use crate::config::ObexConfig;
use crate::error::BtError;
use crate::prompt::{Answer, Prompt, PromptKind, Prompter};

pub const OBEX_AGENT_PATH: &str = "/org/bluez/Blueland/ObexAgent";

const OBEX_AGENT_INTERFACE: &str = "org.bluez.obex.Agent1";
const OBEX_AGENT_MANAGER_INTERFACE: &str = "org.bluez.obex.AgentManager1";
const TRANSFER_INTERFACE: &str = "org.bluez.obex.Transfer1";
const OBEX_REJECTED_ERROR: &str = "org.bluez.obex.Error.Rejected";

const PROPERTY_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_RETRY: Duration = Duration::from_secs(5);

pub struct ObexAgent<P> {
    conn: Arc<SyncConnection>,
    gate: PushGate<P>,
}

impl<P: Prompter> ObexAgent<P> {
    pub fn new(prompter: Arc<P>, conn: Arc<SyncConnection>, config: &ObexConfig) -> Self {
        Self {
            conn,
            gate: PushGate::new(prompter, config),
        }
    }

    /// Returns where obexd should write the incoming file.
    async fn authorize_push(&self, transfer: Path<'static>) -> Result<String, BtError> {
        let proxy = Proxy::new(OBEX_DBUS, transfer.clone(), PROPERTY_TIMEOUT, self.conn.clone());
        let name: String = proxy.get(TRANSFER_INTERFACE, "Name").await?;
        let size: u64 = proxy.get(TRANSFER_INTERFACE, "Size").await.unwrap_or(0);
        info!("Incoming file {} ({} bytes) on {}", name, size, transfer);

        let target = self.gate.decide(&name, size).await?;
        Ok(target.to_string_lossy().into_owned())
    }
}

/// Accept-or-refuse decision for one incoming push. obexd authorizes one
/// transfer at a time, so a single cancel slot is enough.
struct PushGate<P> {
    prompter: Arc<P>,
    download_dir: PathBuf,
    auto_accept: bool,
    // dropping the sender tears the open prompt down
    pending: Mutex<Option<oneshot::Sender<()>>>,
}

impl<P: Prompter> PushGate<P> {
    fn new(prompter: Arc<P>, config: &ObexConfig) -> Self {
        Self {
            prompter,
            download_dir: config.download_dir.clone(),
            auto_accept: config.auto_accept,
            pending: Mutex::new(None),
        }
    }

    async fn decide(&self, name: &str, size: u64) -> Result<PathBuf, BtError> {
        let target = destination(&self.download_dir, name)?;
        if self.auto_accept {
            return Ok(target);
        }

        let prompt = Prompt::new(PromptKind::YesNo, format!("Accept file {name} ({size} bytes)?"));
        let (keep, cancel) = oneshot::channel();
        *self.slot() = Some(keep);
        let answer = self.prompter.ask(prompt, cancel).await;
        self.slot().take();

        if answer != Answer::Confirmed(true) {
            info!("Refused {}", name);
            return Err(BtError::Rejected);
        }
        Ok(target)
    }

    /// The sender gave up; close whatever prompt is still open.
    fn cancel(&self) {
        if self.slot().take().is_some() {
            info!("Incoming transfer cancelled, closing prompt");
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Joins the sender-supplied name onto `dir`, keeping only its final component.
fn destination(dir: &FsPath, name: &str) -> Result<PathBuf, BtError> {
    FsPath::new(name)
        .file_name()
        .map(|file| dir.join(file))
        .ok_or(BtError::Rejected)
}

fn rejected(err: BtError) -> MethodErr {
    dbus::Error::new_custom(OBEX_REJECTED_ERROR, &err.to_string()).into()
}

fn register_interface<P: Prompter>(cr: &mut Crossroads) -> IfaceToken<Arc<ObexAgent<P>>> {
    cr.register(OBEX_AGENT_INTERFACE, |b: &mut IfaceBuilder<Arc<ObexAgent<P>>>| {
        b.method_with_cr_async(
            "AuthorizePush",
            ("transfer",),
            ("filename",),
            |mut ctx, cr, (transfer,): (Path<'static>,)| {
                let agent = cr.data_mut::<Arc<ObexAgent<P>>>(ctx.path()).cloned();
                async move {
                    let reply = match agent {
                        Some(agent) => agent.authorize_push(transfer).await.map(|path| (path,)).map_err(rejected),
                        None => Err(MethodErr::no_path(&Path::from(OBEX_AGENT_PATH))),
                    };
                    ctx.reply(reply)
                }
            },
        );
        b.method("Cancel", (), (), |_, agent: &mut Arc<ObexAgent<P>>, ()| {
            agent.gate.cancel();
            Ok(())
        });
        b.method("Release", (), (), |_, _, ()| {
            info!("OBEX agent released");
            Ok(())
        });
    })
}

/// Exports the push agent on the session bus and keeps trying to register it
/// until obexd shows up.
pub fn start<P: Prompter>(conn: Arc<SyncConnection>, agent: ObexAgent<P>) {
    let mut cr = Crossroads::new();
    cr.set_async_support(Some((
        conn.clone(),
        Box::new(|fut| {
            tokio::spawn(fut);
        }),
    )));
    let token = register_interface::<P>(&mut cr);
    cr.insert(OBEX_AGENT_PATH, &[token], Arc::new(agent));

    conn.start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| {
            if cr.handle_message(msg, conn).is_err() {
                debug!("Unhandled method call on session bus");
            }
            true
        }),
    );

    tokio::spawn(register(conn));
}

async fn register(conn: Arc<SyncConnection>) {
    let manager = Proxy::new(OBEX_DBUS, OBEX_PATH, PROPERTY_TIMEOUT, conn);
    loop {
        let registered: Result<(), dbus::Error> = manager
            .method_call(OBEX_AGENT_MANAGER_INTERFACE, "RegisterAgent", (Path::from(OBEX_AGENT_PATH),))
            .await;
        match registered {
            Ok(()) => break,
            Err(e) if e.name() == Some("org.bluez.obex.Error.AlreadyExists") => break,
            Err(e) => {
                warn!("OBEX agent registration failed, retrying: {}", e);
                tokio::time::sleep(REGISTER_RETRY).await;
            }
        }
    }
    info!("OBEX agent registered at {}", OBEX_AGENT_PATH);
}
