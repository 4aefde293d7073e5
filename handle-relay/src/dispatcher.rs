//! The dispatcher owns the handle registry.
//!
//! Connections and the console never touch the registry. They hold a
//! [`DispatcherHandle`] and submit requests over three queues (registrations,
//! unregistrations, routed commands). A single control loop takes one request
//! at a time from whichever queue is ready and runs it to completion, which is
//! what keeps the registry consistent without locks.
//!
//! Registry mutations and unicasts resolve only once the loop has applied
//! them, so a connection's requests can never be reordered across queues and
//! every reply reaches the connection in the order its commands were sent.
//! Routing only pushes frames onto session queues; it never waits on a socket.

use std::{collections::HashMap, fmt};

use anyhow::{Result, anyhow};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    codec::{self, Message},
    session::{Session, SessionId},
};

const REQUEST_QUEUE_CAPACITY: usize = 256;

/// Requests that read or route through the registry.
#[derive(Debug)]
pub enum Command {
    Unicast {
        sender: String,
        recipient: String,
        message: Message,
        routed: oneshot::Sender<()>,
    },
    Broadcast {
        sender: String,
        body: Vec<u8>,
        reply: oneshot::Sender<BroadcastReport>,
    },
    ListClients {
        reply: oneshot::Sender<Roster>,
    },
}

/// Asks the dispatcher to forget `handle` if it still belongs to `session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistration {
    pub handle: String,
    pub session: SessionId,
}

/// A registry mutation plus the channel that reports it has been applied.
#[derive(Debug)]
struct Mutation<T> {
    request: T,
    applied: oneshot::Sender<()>,
}

/// Registered handles at the moment `ListClients` ran.
///
/// Formatting is deferred to `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    handles: Vec<String>,
}

impl Roster {
    pub fn handles(&self) -> &[String] {
        &self.handles
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl fmt::Display for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.handles.is_empty() {
            return f.write_str("No active users!");
        }
        f.write_str("Current active users: ")?;
        write_handles(f, &self.handles)
    }
}

/// Outcome of `BroadcastAll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastReport {
    NoActiveUsers,
    /// Handles the broadcast frame was written to.
    Delivered(Vec<String>),
}

impl fmt::Display for BroadcastReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveUsers => f.write_str("No active users to broadcast!"),
            Self::Delivered(handles) => {
                f.write_str("Broadcast sent to ")?;
                write_handles(f, handles)
            }
        }
    }
}

fn write_handles(f: &mut fmt::Formatter<'_>, handles: &[String]) -> fmt::Result {
    for (index, handle) in handles.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "@{handle}")?;
    }
    Ok(())
}

/// Cloneable entry point into a running [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    register: mpsc::Sender<Mutation<Session>>,
    unregister: mpsc::Sender<Mutation<Unregistration>>,
    commands: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Registers `session`, returning once the registry holds it.
    pub async fn register(&self, session: Session) -> Result<()> {
        apply(&self.register, session).await
    }

    /// Removes `handle` if `session` still owns it, returning once applied.
    pub async fn unregister(&self, handle: String, session: SessionId) -> Result<()> {
        apply(&self.unregister, Unregistration { handle, session }).await
    }

    /// Routes `message` to `recipient`, returning once it has been queued
    /// for delivery or dropped.
    pub async fn unicast(&self, sender: String, recipient: String, message: Message) -> Result<()> {
        let (routed, done) = oneshot::channel();
        self.submit(Command::Unicast {
            sender,
            recipient,
            message,
            routed,
        })
        .await?;
        done.await.map_err(|_| stopped())
    }

    pub async fn broadcast(&self, sender: String, body: Vec<u8>) -> Result<BroadcastReport> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Broadcast {
            sender,
            body,
            reply,
        })
        .await?;
        response.await.map_err(|_| stopped())
    }

    pub async fn list_clients(&self) -> Result<Roster> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::ListClients { reply }).await?;
        response.await.map_err(|_| stopped())
    }

    async fn submit(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

async fn apply<T>(queue: &mpsc::Sender<Mutation<T>>, request: T) -> Result<()> {
    let (applied, done) = oneshot::channel();
    queue
        .send(Mutation { request, applied })
        .await
        .map_err(|_| stopped())?;
    done.await.map_err(|_| stopped())
}

fn stopped() -> anyhow::Error {
    anyhow!("dispatcher is not running")
}

/// Single owner of the handle → session registry.
pub struct Dispatcher {
    registry: HashMap<String, Session>,
    registrations: mpsc::Receiver<Mutation<Session>>,
    unregistrations: mpsc::Receiver<Mutation<Unregistration>>,
    commands: mpsc::Receiver<Command>,
}

impl Dispatcher {
    /// Creates an idle dispatcher and the handle that feeds it. Requests queue
    /// up until [`Dispatcher::run`] is polled.
    pub fn new() -> (Self, DispatcherHandle) {
        let (register, registrations) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (unregister, unregistrations) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (commands_tx, commands) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

        let dispatcher = Self {
            registry: HashMap::new(),
            registrations,
            unregistrations,
            commands,
        };
        let handle = DispatcherHandle {
            register,
            unregister,
            commands: commands_tx,
        };
        (dispatcher, handle)
    }

    /// Creates a dispatcher and runs it on its own task.
    pub fn spawn() -> (DispatcherHandle, JoinHandle<()>) {
        let (dispatcher, handle) = Self::new();
        (handle, tokio::spawn(dispatcher.run()))
    }

    /// Runs the control loop until every [`DispatcherHandle`] is dropped.
    pub async fn run(mut self) {
        loop {
            select! {
                Some(Mutation { request, applied }) = self.registrations.recv() => {
                    self.register(request);
                    let _ = applied.send(());
                }
                Some(Mutation { request, applied }) = self.unregistrations.recv() => {
                    self.unregister(request);
                    let _ = applied.send(());
                }
                Some(command) = self.commands.recv() => self.route(command),
                else => break,
            }
        }
        debug!(remaining = self.registry.len(), "dispatcher stopped");
    }

    fn register(&mut self, session: Session) {
        info!(handle = %session.handle, session = %session.id, "user registered");
        session.outbound.send(codec::REGISTERED_ACK);

        if let Some(previous) = self.registry.insert(session.handle.clone(), session) {
            // The superseded connection stays open; it only loses the handle.
            info!(handle = %previous.handle, session = %previous.id, "handle taken over");
        }
    }

    fn unregister(&mut self, leaving: Unregistration) {
        let owner = self.registry.get(&leaving.handle).map(|session| session.id);
        match owner {
            Some(owner) if owner == leaving.session => {
                self.registry.remove(&leaving.handle);
                info!(handle = %leaving.handle, session = %leaving.session, "user left");
            }
            Some(owner) => {
                debug!(
                    handle = %leaving.handle,
                    leaving = %leaving.session,
                    current = %owner,
                    "ignoring unregistration of a superseded session"
                );
            }
            None => {}
        }
    }

    fn route(&mut self, command: Command) {
        match command {
            Command::Unicast {
                sender,
                recipient,
                message,
                routed,
            } => {
                self.route_unicast(&sender, &recipient, &message);
                let _ = routed.send(());
            }
            Command::Broadcast {
                sender,
                body,
                reply,
            } => {
                let report = self.broadcast_all(&sender, &body);
                if reply.send(report).is_err() {
                    debug!("broadcast requester went away");
                }
            }
            Command::ListClients { reply } => {
                if reply.send(self.list_clients()).is_err() {
                    debug!("client list requester went away");
                }
            }
        }
    }

    fn route_unicast(&self, sender: &str, recipient: &str, message: &Message) {
        match self.registry.get(recipient) {
            Some(session) => {
                session
                    .outbound
                    .send(codec::frame_delivery(sender, &message.content));
            }
            None => debug!(sender, recipient, "recipient not registered; dropping message"),
        }
    }

    fn list_clients(&self) -> Roster {
        let mut handles: Vec<String> = self.registry.keys().cloned().collect();
        handles.sort();
        Roster { handles }
    }

    fn broadcast_all(&self, sender: &str, body: &[u8]) -> BroadcastReport {
        if self.registry.is_empty() {
            return BroadcastReport::NoActiveUsers;
        }

        let frame = codec::frame_delivery(sender, body);
        let mut handles = Vec::with_capacity(self.registry.len());
        for (handle, session) in &self.registry {
            debug!(%handle, "broadcasting");
            session.outbound.send(frame.clone());
            handles.push(handle.clone());
        }
        handles.sort();
        BroadcastReport::Delivered(handles)
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, time::Duration};

    use tokio::{sync::mpsc::Receiver, time::timeout};

    use super::*;
    use crate::session::Outbound;

    fn session(handle: &str) -> (Session, Receiver<Vec<u8>>) {
        session_with_capacity(handle, 16)
    }

    fn session_with_capacity(handle: &str, capacity: usize) -> (Session, Receiver<Vec<u8>>) {
        let id = SessionId::next();
        let capacity = NonZeroUsize::new(capacity).expect("non-zero capacity");
        let (outbound, frames) = Outbound::channel(id, capacity);
        let session = Session {
            handle: handle.to_string(),
            id,
            outbound,
        };
        (session, frames)
    }

    async fn registered(handle: &DispatcherHandle, name: &str) -> (SessionId, Receiver<Vec<u8>>) {
        let (session, mut frames) = session(name);
        let id = session.id;
        handle.register(session).await.expect("register");
        assert_eq!(frames.recv().await, Some(b"Done!\n".to_vec()));
        (id, frames)
    }

    #[tokio::test]
    async fn registered_handle_is_listed_once() {
        let (handle, _task) = Dispatcher::spawn();
        let _alice = registered(&handle, "alice").await;
        let _bob = registered(&handle, "bob").await;

        let roster = handle.list_clients().await.expect("list");
        assert_eq!(roster.handles(), ["alice".to_string(), "bob".to_string()]);
        assert_eq!(roster.to_string(), "Current active users: @alice, @bob");
    }

    #[tokio::test]
    async fn empty_roster_reports_no_active_users() {
        let (handle, _task) = Dispatcher::spawn();
        let roster = handle.list_clients().await.expect("list");
        assert!(roster.is_empty());
        assert_eq!(roster.to_string(), "No active users!");
    }

    #[tokio::test]
    async fn unicast_reaches_recipient_only() {
        let (handle, _task) = Dispatcher::spawn();
        let (_, mut alice) = registered(&handle, "alice").await;
        let (_, mut bob) = registered(&handle, "bob").await;

        handle
            .unicast("alice".into(), "bob".into(), Message::new(&b"hello"[..]))
            .await
            .expect("unicast");
        // Round-trip through the loop so the unicast has been processed.
        handle.list_clients().await.expect("list");

        assert_eq!(bob.try_recv().ok(), Some(b"@alice hello\n".to_vec()));
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_to_unknown_handle_is_dropped() {
        let (handle, _task) = Dispatcher::spawn();
        let (_, mut alice) = registered(&handle, "alice").await;

        handle
            .unicast("alice".into(), "carol".into(), Message::new(&b"hi!"[..]))
            .await
            .expect("unicast");
        handle.list_clients().await.expect("list");

        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn reregistration_replaces_previous_session() {
        let (handle, _task) = Dispatcher::spawn();
        let (first, mut old_frames) = registered(&handle, "alice").await;
        let (_, mut new_frames) = registered(&handle, "alice").await;

        handle
            .unicast("bob".into(), "alice".into(), Message::new(&b"hey"[..]))
            .await
            .expect("unicast");
        let roster = handle.list_clients().await.expect("list");
        assert_eq!(roster.handles(), ["alice".to_string()]);
        assert_eq!(new_frames.try_recv().ok(), Some(b"@bob hey\n".to_vec()));
        assert!(old_frames.try_recv().is_err());

        // The superseded connection leaving must not evict its replacement.
        handle.unregister("alice".into(), first).await.expect("unregister");
        let roster = handle.list_clients().await.expect("list");
        assert_eq!(roster.handles(), ["alice".to_string()]);
    }

    #[tokio::test]
    async fn unregister_removes_handle_and_ignores_unknown() {
        let (handle, _task) = Dispatcher::spawn();
        let (alice, _frames) = registered(&handle, "alice").await;

        handle.unregister("nobody".into(), alice).await.expect("unregister");
        handle.unregister("alice".into(), alice).await.expect("unregister");
        handle.unregister("alice".into(), alice).await.expect("unregister");

        let roster = handle.list_clients().await.expect("list");
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn broadcast_with_no_sessions_reports_it() {
        let (handle, _task) = Dispatcher::spawn();
        let report = handle
            .broadcast("system".into(), b"anyone?".to_vec())
            .await
            .expect("broadcast");
        assert_eq!(report, BroadcastReport::NoActiveUsers);
        assert_eq!(report.to_string(), "No active users to broadcast!");
    }

    #[tokio::test]
    async fn broadcast_writes_once_per_session() {
        let (handle, _task) = Dispatcher::spawn();
        let (_, mut alice) = registered(&handle, "alice").await;
        let (_, mut bob) = registered(&handle, "bob").await;

        let report = handle
            .broadcast("system".into(), b"maintenance in 5 min".to_vec())
            .await
            .expect("broadcast");
        assert_eq!(
            report,
            BroadcastReport::Delivered(vec!["alice".into(), "bob".into()])
        );

        for frames in [&mut alice, &mut bob] {
            assert_eq!(
                frames.try_recv().ok(),
                Some(b"@system maintenance in 5 min\n".to_vec())
            );
            assert!(frames.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn full_recipient_queue_does_not_hold_up_others() {
        let (handle, _task) = Dispatcher::spawn();
        // The ack takes the only slot and nobody drains it.
        let (stuck, _stuck_frames) = session_with_capacity("stuck", 1);
        handle.register(stuck).await.expect("register");
        let (_, mut bob) = registered(&handle, "bob").await;

        timeout(Duration::from_secs(1), async {
            handle
                .unicast("bob".into(), "stuck".into(), Message::new(&b"dropped"[..]))
                .await
                .expect("unicast");
            handle
                .unicast("stuck".into(), "bob".into(), Message::new(&b"hi"[..]))
                .await
                .expect("unicast");
            assert_eq!(bob.try_recv().ok(), Some(b"@stuck hi\n".to_vec()));

            let report = handle
                .broadcast("system".into(), b"still here".to_vec())
                .await
                .expect("broadcast");
            assert_eq!(
                report,
                BroadcastReport::Delivered(vec!["bob".into(), "stuck".into()])
            );
            assert_eq!(bob.try_recv().ok(), Some(b"@system still here\n".to_vec()));
        })
        .await
        .expect("routing stalled behind a full queue");
    }

    #[tokio::test]
    async fn loop_stops_when_handles_are_dropped() {
        let (handle, task) = Dispatcher::spawn();
        drop(handle);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher should stop")
            .expect("dispatcher task panicked");
    }
}
