use crate::service::ServiceCtx;
use std::fmt;

/// Why a protocol callback is being invoked.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CallbackReason {
    /// Fired once per connection, right after the upgrade completes;
    /// the per-session user space has just been allocated and zeroed.
    Established,
    /// Fired exactly once iff `Established` fired. Last use of the
    /// user space.
    Closed,
    /// An application message delivered by the framing engine.
    Receive,
    /// A broadcast payload; the callback decides whether to forward
    /// it to the wire.
    Broadcast,
    /// A non-upgrade HTTP request, delivered to the first protocol in
    /// the table with the requested URI as payload.
    Http,
}

/// Opaque connection handle handed to callbacks. A handle held across
/// a teardown stops resolving; operations on it report
/// [`ErrorType::Gone`](crate::ErrorType::Gone) instead of touching a
/// recycled record.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnId(pub(crate) usize);

pub type Callback =
    Box<dyn Fn(&mut ServiceCtx<'_>, ConnId, CallbackReason, &mut [u8], &[u8]) + Send + Sync>;

/// One user protocol: a name, the callback servicing its connections,
/// and the size of the per-session user space. The table index and
/// the rendezvous port are stamped in at bootstrap.
pub struct Protocol {
    name: String,
    callback: Callback,
    session_len: usize,
    index: usize,
    broadcast_port: u16,
}

impl Protocol {
    pub fn new<S: Into<String>>(name: S, session_len: usize, callback: Callback) -> Protocol {
        Protocol {
            name: name.into(),
            callback,
            session_len,
            index: 0,
            broadcast_port: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the per-session user space allocated at establishment.
    #[inline]
    pub fn session_len(&self) -> usize {
        self.session_len
    }

    /// Stable table index, assigned at bootstrap.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Loop-side rendezvous port, recorded at bootstrap.
    #[inline]
    pub fn broadcast_port(&self) -> u16 {
        self.broadcast_port
    }

    #[inline]
    pub(crate) fn callback(&self) -> &Callback {
        &self.callback
    }

    #[inline]
    pub(crate) fn stamp(&mut self, index: usize, broadcast_port: u16) {
        self.index = index;
        self.broadcast_port = broadcast_port;
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("session_len", &self.session_len)
            .field("broadcast_port", &self.broadcast_port)
            .finish()
    }
}

/// The ordered protocol table. Built once at bootstrap, read-only
/// afterwards and shared between the service loop and the embedding
/// application.
pub struct Protocols {
    entries: Vec<Protocol>,
}

impl Protocols {
    pub(crate) fn new(entries: Vec<Protocol>) -> Protocols {
        Protocols { entries }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Protocol> {
        self.entries.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Protocol> {
        self.entries.iter().find(|protocol| protocol.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Protocol {
        Protocol::new(name, 0, Box::new(|_, _, _, _, _| ()))
    }

    #[test]
    fn test_table_lookup() {
        let mut chat = noop("chat");
        let mut echo = noop("echo");
        chat.stamp(0, 40001);
        echo.stamp(1, 40002);

        let table = Protocols::new(vec![chat, echo]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.by_name("chat").unwrap().index(), 0);
        assert_eq!(table.by_name("echo").unwrap().broadcast_port(), 40002);
        assert!(table.by_name("missing").is_none());
        assert_eq!(table.get(1).unwrap().name(), "echo");
        assert!(table.get(2).is_none());
    }
}
