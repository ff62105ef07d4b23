//! Async driver for an [`Agent`]
//!
//! The agent is a plain single-owner state machine. [`AgentRunner`] moves
//! it onto one tokio task and multiplexes its inputs:
//!
//! ```text
//!   AgentHandle ──commands──┐
//!   transport events ───────┤
//!   DNS answers ────────────┼──> AgentRunner (owns Agent) ──events──> application
//!   next_wakeup() sleep ────┘
//! ```
//!
//! Every external call goes through the command channel, so the agent is
//! never touched from two tasks.

use std::fmt;

use bytes::Bytes;
use futures::future;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use siptx_sip_resolver::DnsAnswer;
use siptx_sip_transport::TransportEvent;

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::incoming::ResponseSpec;
use crate::leg::LegSpec;
use crate::outgoing::RequestSpec;
use crate::queue::{IncomingId, LegId, OutgoingId};
use crate::stats::AgentStats;

/// Buffer size of the command channel
const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;
type AgentFn = Box<dyn FnOnce(&mut Agent) + Send>;

enum Command {
    Request(RequestSpec, Reply<OutgoingId>),
    Reply {
        id: IncomingId,
        spec: ResponseSpec,
        reliable: bool,
        tx: Reply<()>,
    },
    Cancel(OutgoingId, Reply<OutgoingId>),
    Prack {
        id: OutgoingId,
        body: Option<(String, Bytes)>,
        tx: Reply<OutgoingId>,
    },
    Tagged {
        id: OutgoingId,
        tag: String,
        tx: Reply<OutgoingId>,
    },
    DestroyIncoming(IncomingId, Reply<()>),
    DestroyOutgoing(OutgoingId, Reply<()>),
    LegCreate(LegSpec, oneshot::Sender<LegId>),
    LegDestroy(LegId, Reply<()>),
    Stats(oneshot::Sender<AgentStats>),
    With(AgentFn),
    Shutdown(oneshot::Sender<()>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Request(..) => "Request",
            Command::Reply { .. } => "Reply",
            Command::Cancel(..) => "Cancel",
            Command::Prack { .. } => "Prack",
            Command::Tagged { .. } => "Tagged",
            Command::DestroyIncoming(..) => "DestroyIncoming",
            Command::DestroyOutgoing(..) => "DestroyOutgoing",
            Command::LegCreate(..) => "LegCreate",
            Command::LegDestroy(..) => "LegDestroy",
            Command::Stats(..) => "Stats",
            Command::With(..) => "With",
            Command::Shutdown(..) => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Owns the agent and runs it until shutdown
pub struct AgentRunner {
    agent: Agent,
    commands: mpsc::Receiver<Command>,
    transport: mpsc::Receiver<TransportEvent>,
    dns: Option<mpsc::UnboundedReceiver<DnsAnswer>>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

/// Cloneable front end of a running agent
#[derive(Clone, Debug)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
}

impl AgentRunner {
    /// Wrap `agent`. Returns the runner, a handle and the event stream.
    pub fn new(
        agent: Agent,
        transport: mpsc::Receiver<TransportEvent>,
    ) -> (Self, AgentHandle, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events, events_rx) = mpsc::unbounded_channel();
        let runner = AgentRunner {
            agent,
            commands,
            transport,
            dns: None,
            events,
        };
        (runner, AgentHandle { tx }, events_rx)
    }

    /// Feed answers from a [`SpawnedBackend`](siptx_sip_resolver::SpawnedBackend)
    pub fn with_dns(mut self, answers: mpsc::UnboundedReceiver<DnsAnswer>) -> Self {
        self.dns = Some(answers);
        self
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the agent until a shutdown command arrives or every handle
    /// is dropped
    pub async fn run(mut self) {
        info!(instance = %self.agent.instance_id(), "agent runner started");
        let mut transport_open = true;
        let mut shutdown_ack = None;

        loop {
            self.flush_events();
            let wakeup = self.agent.next_wakeup();
            let sleep = async move {
                match wakeup {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.execute(command),
                    None => {
                        debug!("every agent handle dropped");
                        break;
                    }
                },
                event = self.transport.recv(), if transport_open => match event {
                    Some(event) => self.agent.handle_transport_event(event),
                    None => {
                        warn!("transport event stream ended");
                        transport_open = false;
                    }
                },
                answer = recv_optional(&mut self.dns) => match answer {
                    Some(answer) => self.agent.dns_answer(answer),
                    None => self.dns = None,
                },
                _ = sleep => {
                    let fired = self.agent.tick();
                    trace!(fired, "scheduler step");
                }
            }
        }

        self.agent.shutdown();
        self.flush_events();
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        info!("agent runner stopped");
    }

    fn execute(&mut self, command: Command) {
        trace!(?command, "agent command");
        let agent = &mut self.agent;
        match command {
            Command::Request(spec, tx) => {
                let _ = tx.send(agent.request(spec));
            }
            Command::Reply {
                id,
                spec,
                reliable,
                tx,
            } => {
                let result = if reliable {
                    agent.reliable_reply(id, spec)
                } else {
                    agent.reply_with(id, spec)
                };
                let _ = tx.send(result);
            }
            Command::Cancel(id, tx) => {
                let _ = tx.send(agent.cancel(id));
            }
            Command::Prack { id, body, tx } => {
                let _ = tx.send(agent.prack(id, body));
            }
            Command::Tagged { id, tag, tx } => {
                let _ = tx.send(agent.tagged(id, &tag));
            }
            Command::DestroyIncoming(id, tx) => {
                let _ = tx.send(agent.destroy_incoming(id));
            }
            Command::DestroyOutgoing(id, tx) => {
                let _ = tx.send(agent.destroy_outgoing(id));
            }
            Command::LegCreate(spec, tx) => {
                let _ = tx.send(agent.leg_create(spec));
            }
            Command::LegDestroy(id, tx) => {
                let _ = tx.send(agent.leg_destroy(id));
            }
            Command::Stats(tx) => {
                let _ = tx.send(agent.stats());
            }
            Command::With(f) => f(agent),
            Command::Shutdown(_) => {}
        }
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.agent.next_event() {
            if self.events.send(event).is_err() {
                // Nobody listens; keep the queue from growing
                self.agent.drain_events();
                return;
            }
        }
    }
}

impl fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRunner")
            .field("agent", &self.agent)
            .field("dns", &self.dns.is_some())
            .finish()
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

impl AgentHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn request(&self, spec: RequestSpec) -> Result<OutgoingId> {
        self.call(|tx| Command::Request(spec, tx)).await?
    }

    pub async fn reply(&self, id: IncomingId, spec: ResponseSpec) -> Result<()> {
        self.call(|tx| Command::Reply {
            id,
            spec,
            reliable: false,
            tx,
        })
        .await?
    }

    /// Send a provisional response reliably
    pub async fn reliable_reply(&self, id: IncomingId, spec: ResponseSpec) -> Result<()> {
        self.call(|tx| Command::Reply {
            id,
            spec,
            reliable: true,
            tx,
        })
        .await?
    }

    pub async fn cancel(&self, id: OutgoingId) -> Result<OutgoingId> {
        self.call(|tx| Command::Cancel(id, tx)).await?
    }

    pub async fn prack(
        &self,
        id: OutgoingId,
        body: Option<(String, Bytes)>,
    ) -> Result<OutgoingId> {
        self.call(|tx| Command::Prack { id, body, tx }).await?
    }

    pub async fn tagged(&self, id: OutgoingId, tag: impl Into<String>) -> Result<OutgoingId> {
        let tag = tag.into();
        self.call(|tx| Command::Tagged { id, tag, tx }).await?
    }

    pub async fn destroy_incoming(&self, id: IncomingId) -> Result<()> {
        self.call(|tx| Command::DestroyIncoming(id, tx)).await?
    }

    pub async fn destroy_outgoing(&self, id: OutgoingId) -> Result<()> {
        self.call(|tx| Command::DestroyOutgoing(id, tx)).await?
    }

    pub async fn leg_create(&self, spec: LegSpec) -> Result<LegId> {
        self.call(|tx| Command::LegCreate(spec, tx)).await
    }

    pub async fn leg_destroy(&self, id: LegId) -> Result<()> {
        self.call(|tx| Command::LegDestroy(id, tx)).await?
    }

    pub async fn stats(&self) -> Result<AgentStats> {
        self.call(Command::Stats).await
    }

    /// Run `f` on the agent task and return its result
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Agent) -> T + Send + 'static,
    {
        self.call(|tx| {
            Command::With(Box::new(move |agent: &mut Agent| {
                let _ = tx.send(f(agent));
            }))
        })
        .await
    }

    /// Stop the runner; pending transactions are answered and freed
    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }
}
