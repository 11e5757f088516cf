use std::net::IpAddr;
use std::time::SystemTime;

use bytes::Bytes;

/// TLS facts announced by the MTA once the handshake has completed.
///
/// The MTA hands these over as free-form macro strings, so they are kept
/// verbatim rather than parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFacts {
    pub cert_issuer: String,
    pub cert_subject: String,
    pub cipher: String,
    pub cipher_bits: String,
    pub tls_version: String,
}

/// SASL authentication facts for the session, absent for unauthenticated mail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslFacts {
    pub sender: String,
    pub method: String,
    pub username: String,
}

/// One header field as it arrived, order and duplicates preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// One mail transaction within a session.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub from: String,
    pub rcpt: Vec<String>,
    pub headers: Vec<Header>,
    pub queue_id: String,
    body: Vec<Bytes>,
    finalized: bool,
}

impl Message {
    fn new(from: String) -> Self {
        Message {
            from,
            ..Message::default()
        }
    }

    pub(crate) fn append_body(&mut self, chunk: Bytes) {
        self.body.push(chunk);
    }

    /// The full body, concatenated in arrival order.
    pub fn body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body_len());
        for chunk in &self.body {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn body_len(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// State for one MTA connection, from connect to close.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub hostname: String,
    pub address: Option<IpAddr>,
    pub helo: Option<String>,
    pub tls: Option<TlsFacts>,
    pub sasl: Option<SaslFacts>,
    messages: Vec<Message>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Session {
            id,
            started_at: SystemTime::now(),
            ended_at: None,
            hostname: String::new(),
            address: None,
            helo: None,
            tls: None,
            sasl: None,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Starts a new transaction. The previous one, finalized or aborted, is
    /// history at this point.
    pub(crate) fn begin_message(&mut self, from: String) {
        self.messages.push(Message::new(from));
    }

    /// Index of the transaction still accepting data, if any.
    pub(crate) fn current_index(&self) -> Option<usize> {
        match self.messages.last() {
            Some(message) if !message.finalized => Some(self.messages.len() - 1),
            _ => None,
        }
    }

    pub(crate) fn current_message(&mut self) -> Option<&mut Message> {
        self.current_index().map(|idx| &mut self.messages[idx])
    }

    pub(crate) fn finalize_current(&mut self) {
        if let Some(message) = self.current_message() {
            message.finalized = true;
        }
    }

    /// Drops the in-progress transaction, keeping finalized ones. Returns
    /// whether anything was dropped, so a second abort is a no-op.
    pub(crate) fn abort_message(&mut self) -> bool {
        match self.current_index() {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn end(&mut self) {
        self.ended_at = Some(SystemTime::now());
    }
}
