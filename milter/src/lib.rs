use async_trait::async_trait;
use miette::Result;

pub mod codec;
mod engine;
pub mod metrics;
mod registry;
mod server;
mod session;

pub use engine::{Engine, EngineError, Event};
pub use registry::{ConnId, SessionRegistry, SharedSession};
pub use server::MilterServer;
pub use session::{Header, Message, SaslFacts, Session, TlsFacts};

/// Policy outcome for a finalized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Permit,
    TempFail,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Permit => "permit",
            Verdict::TempFail => "tempfail",
            Verdict::Reject => "reject",
        }
    }
}

/// A verdict together with the explanation handed back to the MTA.
#[derive(Debug, Clone)]
pub struct Judgement {
    pub verdict: Verdict,
    pub message: String,
}

impl Judgement {
    pub fn new(verdict: Verdict, message: impl Into<String>) -> Self {
        Judgement {
            verdict,
            message: message.into(),
        }
    }

    pub fn permit() -> Self {
        Judgement::new(Verdict::Permit, "")
    }
}

/// An SMTP-style reply: basic status code, enhanced status code, text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub enhanced: &'static str,
    pub message: String,
}

impl Reply {
    /// Renders the reply the way SMFIR_REPLYCODE expects it on the wire.
    pub fn smtp_line(&self) -> String {
        format!("{} {} {}", self.code, self.enhanced, self.message)
    }
}

/// What the MTA is told to do with the current callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Continue,
    TempFail(Reply),
    Reject(Reply),
}

impl Response {
    pub fn temp_fail(message: impl Into<String>) -> Self {
        Response::TempFail(Reply {
            code: 421,
            enhanced: "4.7.0",
            message: message.into(),
        })
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Response::Reject(Reply {
            code: 550,
            enhanced: "5.7.1",
            message: message.into(),
        })
    }
}

/// Computes the verdict for a finalized message.
///
/// The engine never inspects message content itself; everything the MTA is
/// told at end-of-message comes from this collaborator.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn evaluate(&self, session: &Session, message: &Message) -> Result<Judgement>;
}

/// Receives session snapshots for durable storage.
///
/// Invocations are fire-and-forget: the engine spawns them off the response
/// path and a sink failure never reaches the MTA.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn persist(&self, snapshot: Session) -> Result<()>;
}
