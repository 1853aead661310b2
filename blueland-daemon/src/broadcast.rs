/*!
 * Subscriber Broadcaster
 * Newline-delimited JSON device records pushed to every event-socket reader
 */

use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::coordinator::Handle;
use crate::device::{Address, Device};

/// One line on the event socket. A change carries the device's full current
/// state; subscribers never need to merge deltas themselves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DeviceEvent {
    Changed { device: Device },
    Removed { address: Address },
}

#[derive(Debug)]
pub struct Subscriber {
    id: Uuid,
    queue: mpsc::Sender<Arc<str>>,
}

/// A subscriber and the receiving end of its queue.
pub fn subscriber(queue_depth: usize) -> (Subscriber, mpsc::Receiver<Arc<str>>) {
    let (queue, rx) = mpsc::channel(queue_depth.max(1));
    (
        Subscriber {
            id: Uuid::new_v4(),
            queue,
        },
        rx,
    )
}

/// Live subscribers. Owned by the coordinator; never blocks it.
#[derive(Debug, Default)]
pub struct Broadcaster {
    subscribers: Vec<Subscriber>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subscriber: Subscriber) {
        debug!("Subscriber {} attached", subscriber.id);
        self.subscribers.push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Queues `event` for every subscriber. Full or closed queues drop their
    /// subscriber.
    pub fn publish(&mut self, event: &DeviceEvent) {
        let line: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => format!("{json}\n").into(),
            Err(e) => {
                error!("Failed to serialize device event: {}", e);
                return;
            }
        };

        self.subscribers.retain(|subscriber| match subscriber.queue.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                info!("Dropping slow subscriber {}", subscriber.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber {} went away", subscriber.id);
                false
            }
        });
    }
}

/// Accepts event-socket connections and hands each one to the coordinator.
pub async fn serve(listener: UnixListener, handle: Handle, queue_depth: usize) {
    info!("Event socket listening for subscribers...");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let (subscriber, queue) = subscriber(queue_depth);
                handle.subscribe(subscriber);
                tokio::spawn(write_loop(stream, queue));
            }
            Err(e) => {
                error!("Failed to accept subscriber: {}", e);
            }
        }
    }
}

/// Drains one subscriber's queue into its socket until either side goes away.
async fn write_loop(stream: UnixStream, mut queue: mpsc::Receiver<Arc<str>>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 64];

    loop {
        tokio::select! {
            line = queue.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("Subscriber write failed: {}", e);
                    break;
                }
            }
            // subscribers only read; EOF or an error means they hung up
            read = reader.read(&mut scratch) => {
                if matches!(read, Ok(0) | Err(_)) {
                    break;
                }
            }
        }
    }
}
