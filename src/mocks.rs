//! Mock implementations of [crate::Transport] and [crate::Mailbox] for
//! testing the state machine without sockets.

use crate::{connection::SocketId, crypto::PeerId, Error};
use bytes::Bytes;
use std::{
    cell::RefCell,
    collections::HashSet,
    rc::Rc,
};

/// One call a node made into its transport, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Dial { socket: SocketId, url: String },
    Send { socket: SocketId, frame: Bytes },
    Close { socket: SocketId, code: u16 },
}

/// Shared view of everything a [Transport] was asked to do.
#[derive(Clone, Default)]
pub struct Outbox {
    calls: Rc<RefCell<Vec<Call>>>,
}

impl Outbox {
    /// Take all recorded calls, leaving the outbox empty.
    pub fn drain(&self) -> Vec<Call> {
        self.calls.borrow_mut().drain(..).collect()
    }

    /// Frames sent on `socket`, in order, without draining.
    pub fn sent_frames(&self, socket: &SocketId) -> Vec<Bytes> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Send { socket: s, frame } if s == socket => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A transport that records calls instead of performing them. Dials to a
/// refused URL fail; everything else succeeds.
pub struct Transport {
    outbox: Outbox,
    refused: HashSet<String>,
}

impl Transport {
    pub fn new() -> (Self, Outbox) {
        let outbox = Outbox::default();
        (
            Self {
                outbox: outbox.clone(),
                refused: HashSet::new(),
            },
            outbox,
        )
    }

    /// Make future dials to `url` fail.
    pub fn refuse(&mut self, url: &str) {
        self.refused.insert(url.to_string());
    }
}

impl crate::Transport for Transport {
    fn dial(&mut self, socket: &SocketId, url: &str) -> Result<(), Error> {
        if self.refused.contains(url) {
            return Err(Error::DialFailed(url.to_string()));
        }
        self.outbox.calls.borrow_mut().push(Call::Dial {
            socket: *socket,
            url: url.to_string(),
        });
        Ok(())
    }

    fn send(&mut self, socket: &SocketId, frame: Bytes) -> Result<(), Error> {
        self.outbox.calls.borrow_mut().push(Call::Send {
            socket: *socket,
            frame,
        });
        Ok(())
    }

    fn close(&mut self, socket: &SocketId, code: u16) {
        self.outbox.calls.borrow_mut().push(Call::Close {
            socket: *socket,
            code,
        });
    }
}

/// Shared view of every chat message a [Mailbox] accepted.
#[derive(Clone, Default)]
pub struct Inbox {
    messages: Rc<RefCell<Vec<(PeerId, String)>>>,
}

impl Inbox {
    /// Take all delivered messages, leaving the inbox empty.
    pub fn drain(&self) -> Vec<(PeerId, String)> {
        self.messages.borrow_mut().drain(..).collect()
    }
}

/// A mailbox that records deliveries.
pub struct Mailbox {
    inbox: Inbox,
}

impl Mailbox {
    pub fn new() -> (Self, Inbox) {
        let inbox = Inbox::default();
        (
            Self {
                inbox: inbox.clone(),
            },
            inbox,
        )
    }
}

impl crate::Mailbox for Mailbox {
    fn deliver(&mut self, from: &PeerId, message: &str) {
        self.inbox
            .messages
            .borrow_mut()
            .push((*from, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport as _;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_transport_records_calls() {
        let mut rng = StdRng::seed_from_u64(0);
        let socket = SocketId::generate(&mut rng);
        let (mut transport, outbox) = Transport::new();

        transport.dial(&socket, "ws://example:9000").unwrap();
        transport.send(&socket, Bytes::from_static(b"frame")).unwrap();
        transport.close(&socket, 1000);

        let calls = outbox.drain();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[0],
            Call::Dial {
                socket,
                url: "ws://example:9000".into()
            }
        );
        assert!(outbox.drain().is_empty());
    }

    #[test]
    fn test_refused_dial_fails() {
        let mut rng = StdRng::seed_from_u64(1);
        let socket = SocketId::generate(&mut rng);
        let (mut transport, outbox) = Transport::new();
        transport.refuse("ws://gone:9000");

        assert!(matches!(
            transport.dial(&socket, "ws://gone:9000"),
            Err(Error::DialFailed(_))
        ));
        assert!(outbox.drain().is_empty());
    }
}
