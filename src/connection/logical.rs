//! Logical Connection
//!
//! A per-session handle bound to one physical connection. It never owns the
//! physical connection: the registry does, and it keeps it alive for as long
//! as any logical connection is bound to it.

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

use super::error::{ConnError, ConnResult};
use super::physical::PhysicalConnection;
use super::registry::{LogicalId, PhysicalId};
use crate::protocol::{Message, StreamId};

/// Callback receiving the unsolicited messages of a logical connection's
/// physical connection. Runs on the inbound reader, so it must not block.
pub type UnsolicitedHandler = Arc<dyn Fn(LogicalId, &Message) + Send + Sync>;

#[derive(Clone)]
pub struct LogicalConnection {
    id: LogicalId,
    physical_id: PhysicalId,
    physical: Weak<PhysicalConnection>,
    stream_id: StreamId,
    handler: Option<UnsolicitedHandler>,
}

impl LogicalConnection {
    pub fn new(
        id: LogicalId,
        physical_id: PhysicalId,
        physical: &Arc<PhysicalConnection>,
        stream_id: StreamId,
        handler: Option<UnsolicitedHandler>,
    ) -> Self {
        Self {
            id,
            physical_id,
            physical: Arc::downgrade(physical),
            stream_id,
            handler,
        }
    }

    pub fn id(&self) -> LogicalId {
        self.id
    }

    pub fn physical_id(&self) -> PhysicalId {
        self.physical_id
    }

    /// Correlation id to put in requests sent on behalf of this session
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// The bound physical connection, for the duration of one operation
    pub fn physical(&self) -> ConnResult<Arc<PhysicalConnection>> {
        self.physical.upgrade().ok_or_else(|| {
            ConnError::ReadWriteFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("physical connection {} is gone", self.physical_id),
            ))
        })
    }

    pub async fn read_raw(&self, buf: &mut [u8]) -> ConnResult<usize> {
        self.physical()?.read_raw(buf).await
    }

    pub async fn write_raw(&self, buf: &[u8]) -> ConnResult<usize> {
        self.physical()?.write_raw(buf).await
    }

    /// Forward an unsolicited message to the registered handler.
    /// Returns false when no handler is registered.
    pub fn process_unsolicited_message(&self, message: &Message) -> bool {
        match &self.handler {
            Some(handler) => {
                handler(self.id, message);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("id", &self.id)
            .field("physical_id", &self.physical_id)
            .field("stream_id", &self.stream_id)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}
