use crate::error::Error;
use crate::message::Message;
use crate::registry::ConnectionRegistry;
use crate::split::WSWriter;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

pub type ID = Uuid;

// Connection ids are random v8 uuids instead of a counter, so ids stay
// unguessable and never collide across server instances
pub(crate) fn new_connection_id() -> ID {
    Uuid::new_v8(rand::random())
}

/// Everything a running server reports back to the application: a client
/// arriving (with its write handle), its messages, its departure, and any
/// error its connection ran into.
pub enum Event {
    NewClient(ID, WSWriter),
    NewMessage(ID, Message),
    Disconnect(ID),
    Error(ID, Error),
}

/// The stream of server events handed to the application. It wraps the
/// channel the accept loop feeds and carries the registry of live
/// connections along for shutdown coordination.
pub struct EventStream {
    receiver: Receiver<Event>,
    registry: Arc<ConnectionRegistry>,
}

impl EventStream {
    pub(crate) fn new(receiver: Receiver<Event>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { receiver, registry }
    }

    /// Registry of the live connections behind this server, usable to wait
    /// for all of them to drain on shutdown.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
