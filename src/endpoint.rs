use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HomaConfig;
use crate::packet::HomaPacket;
use crate::receive_scheduler::ReceivedMessage;
use crate::transport::{GrantTimer, HomaTransport, PacketSender};

const EVENT_QUEUE_SIZE: usize = 1024;

/// Application callback for completely received messages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message_complete(&self, message: ReceivedMessage);
}

/// The grant timer of an end point's event loop. The loop sleeps until the current deadline.
struct DeadlineTimer {
    deadline: watch::Sender<Option<Instant>>,
}
impl GrantTimer for DeadlineTimer {
    fn schedule_at(&self, at: Instant) {
        self.deadline.send_replace(Some(at));
    }

    fn cancel(&self) {
        self.deadline.send_replace(None);
    }
}

enum EndPointEvent {
    Datagram {
        source: SocketAddr,
        data: Bytes,
    },
    SendMessage {
        destination: SocketAddr,
        data: Bytes,
        reply: oneshot::Sender<anyhow::Result<u64>>,
    },
}

/// HomaEndPoint runs a [HomaTransport] in its own task, feeding it datagrams and send requests
///  one at a time and firing its grant timer.
///
/// The end point does no socket I/O itself: application code passes in received datagrams, and
///  outgoing packets go to a [PacketSender].
#[derive(Clone)]
pub struct HomaEndPoint {
    local_addr: SocketAddr,
    events: mpsc::Sender<EndPointEvent>,
}

impl HomaEndPoint {
    /// Starts an end point's event loop. The returned task finishes when all handles are dropped,
    ///  or with an error if a peer violates the protocol.
    pub fn spawn(
        config: &HomaConfig,
        packet_sender: Arc<dyn PacketSender>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<(HomaEndPoint, JoinHandle<anyhow::Result<()>>)> {
        let (deadline_send, deadline_recv) = watch::channel(None);
        let grant_timer = Arc::new(DeadlineTimer { deadline: deadline_send });
        let transport = HomaTransport::new(config, packet_sender, grant_timer, Instant::now())?;

        let (events_send, events_recv) = mpsc::channel(EVENT_QUEUE_SIZE);
        let join_handle = tokio::spawn(run_event_loop(transport, events_recv, deadline_recv, message_dispatcher));

        info!("started Homa end point on {:?}", config.local_addr);
        Ok((HomaEndPoint { local_addr: config.local_addr, events: events_send }, join_handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hands a received datagram to the end point
    pub async fn on_datagram(&self, source: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        self.events.send(EndPointEvent::Datagram { source, data }).await
            .map_err(|_| anyhow!("end point {:?} is shut down", self.local_addr))
    }

    /// Sends a message, returning its id once the unscheduled part is sent
    pub async fn send_message(&self, destination: SocketAddr, data: Bytes) -> anyhow::Result<u64> {
        let (reply, reply_recv) = oneshot::channel();
        self.events.send(EndPointEvent::SendMessage { destination, data, reply }).await
            .map_err(|_| anyhow!("end point {:?} is shut down", self.local_addr))?;
        reply_recv.await?
    }
}

async fn run_event_loop(
    mut transport: HomaTransport,
    mut events: mpsc::Receiver<EndPointEvent>,
    deadline: watch::Receiver<Option<Instant>>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
) -> anyhow::Result<()> {
    let result = do_run_event_loop(&mut transport, &mut events, deadline, message_dispatcher.as_ref()).await;
    if let Err(e) = &result {
        error!("protocol violation, shutting down end point {:?}: {}", transport.local_addr(), e);
    }
    result
}

async fn do_run_event_loop(
    transport: &mut HomaTransport,
    events: &mut mpsc::Receiver<EndPointEvent>,
    deadline: watch::Receiver<Option<Instant>>,
    message_dispatcher: &dyn MessageDispatcher,
) -> anyhow::Result<()> {
    loop {
        let next_deadline = *deadline.borrow();

        select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!("all handles of end point {:?} are dropped - shutting down", transport.local_addr());
                    return Ok(());
                };
                on_event(transport, event, message_dispatcher).await?;
            }
            _ = sleep_until_deadline(next_deadline) => {
                transport.on_grant_timer(Instant::now())?;
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn on_event(transport: &mut HomaTransport, event: EndPointEvent, message_dispatcher: &dyn MessageDispatcher) -> anyhow::Result<()> {
    match event {
        EndPointEvent::Datagram { source, mut data } => {
            let packet = match HomaPacket::deser(&mut data, source, transport.local_addr()) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("received unparsable datagram from {:?} - dropping: {}", source, e);
                    return Ok(());
                }
            };

            if let Some(message) = transport.on_packet_received(Instant::now(), packet)? {
                debug!("dispatching message #{} from {:?}", message.msg_id, message.sender);
                message_dispatcher.on_message_complete(message).await;
            }
        }
        EndPointEvent::SendMessage { destination, data, reply } => {
            let result = transport.send_message(Instant::now(), destination, data);
            if reply.send(result).is_err() {
                debug!("caller of send_message went away");
            }
        }
    }
    Ok(())
}
