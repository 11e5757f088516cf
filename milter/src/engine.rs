use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use miette::Diagnostic;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::registry::{ConnId, SessionRegistry, SharedSession};
use crate::session::{Header, SaslFacts, TlsFacts};
use crate::{Judgement, Policy, Response, Session, SessionSink, Verdict};

const HELO_OUT_OF_SEQUENCE: &str = "HELO/EHLO can only be specified at start of session";
const OUT_OF_SEQUENCE: &str = "Commands out of sequence";
const INTERNAL_ERROR: &str = "An internal error occurred";

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("no session is registered for {conn}")]
    #[diagnostic(code(milter::no_session))]
    NoSession { conn: ConnId },

    #[error("session {session} has no open message")]
    #[diagnostic(code(milter::no_message))]
    NoMessage { session: u64 },

    #[error("policy evaluation failed: {message}")]
    #[diagnostic(code(milter::policy_failed))]
    Policy { message: String },
}

/// One protocol callback, already decoded and enriched with the macro-sourced
/// facts relevant at that point of the transaction.
#[derive(Debug, Clone)]
pub enum Event {
    Connect {
        hostname: String,
        address: Option<IpAddr>,
    },
    Helo {
        name: String,
        tls: Option<TlsFacts>,
    },
    MailFrom {
        args: Vec<String>,
    },
    RcptTo {
        args: Vec<String>,
    },
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders {
        sasl: Option<SaslFacts>,
        queue_id: String,
    },
    Body {
        chunk: Bytes,
    },
    EndOfMessage,
    Abort,
    Close,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::Helo { .. } => "helo",
            Event::MailFrom { .. } => "mail_from",
            Event::RcptTo { .. } => "rcpt_to",
            Event::Header { .. } => "header",
            Event::EndOfHeaders { .. } => "end_of_headers",
            Event::Body { .. } => "body",
            Event::EndOfMessage => "end_of_message",
            Event::Abort => "abort",
            Event::Close => "close",
        }
    }
}

/// The callback sequencer: accepts protocol events per connection, validates
/// their order, accumulates session and message state, and produces the
/// protocol response the transport relays to the MTA.
pub struct Engine {
    registry: Arc<SessionRegistry>,
    policy: Arc<dyn Policy>,
    sink: Arc<dyn SessionSink>,
}

impl Engine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        policy: Arc<dyn Policy>,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Engine {
            registry,
            policy,
            sink,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Failure guard around every callback: whatever happens inside handler
    /// logic, the MTA gets one of the three defined responses and the
    /// connection task keeps running.
    pub async fn dispatch(&self, conn: ConnId, event: Event) -> Response {
        let kind = event.kind();
        match AssertUnwindSafe(self.handle(conn, event)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => match err {
                EngineError::NoSession { .. } | EngineError::NoMessage { .. } => {
                    metrics::protocol_error();
                    warn!(%conn, callback = kind, error = %err, "callback out of sequence");
                    Response::temp_fail(OUT_OF_SEQUENCE)
                }
                err => {
                    metrics::handler_failure();
                    error!(%conn, callback = kind, error = %err, "callback handler failed");
                    Response::temp_fail(INTERNAL_ERROR)
                }
            },
            Err(panic) => {
                metrics::handler_failure();
                error!(
                    %conn,
                    callback = kind,
                    panic = %panic_message(&*panic),
                    "panic while handling milter callback, recovering"
                );
                Response::temp_fail(INTERNAL_ERROR)
            }
        }
    }

    async fn handle(&self, conn: ConnId, event: Event) -> Result<Response, EngineError> {
        match event {
            Event::Connect { hostname, address } => self.connect(conn, hostname, address).await,
            Event::Helo { name, tls } => self.helo(conn, name, tls).await,
            Event::MailFrom { args } => self.mail_from(conn, args).await,
            Event::RcptTo { args } => self.rcpt_to(conn, args).await,
            Event::Header { name, value } => self.header(conn, name, value).await,
            Event::EndOfHeaders { sasl, queue_id } => {
                self.end_of_headers(conn, sasl, queue_id).await
            }
            Event::Body { chunk } => self.body(conn, chunk).await,
            Event::EndOfMessage => self.end_of_message(conn).await,
            Event::Abort => self.abort(conn).await,
            Event::Close => self.close(conn).await,
        }
    }

    async fn connect(
        &self,
        conn: ConnId,
        hostname: String,
        address: Option<IpAddr>,
    ) -> Result<Response, EngineError> {
        // A connection announces itself once; a second connect means the
        // transport reused the handle without closing.
        if let Some(stale) = self.registry.remove(conn) {
            metrics::protocol_error();
            warn!(%conn, "connect for a connection that already has a session, replacing");
            let mut stale = stale.lock().await;
            stale.end();
            self.persist(stale.clone());
        }

        let session = self.registry.create(conn);
        {
            let mut session = session.lock().await;
            session.hostname = hostname;
            session.address = address;
            debug!(
                session = session.id,
                %conn,
                hostname = %session.hostname,
                "connect"
            );
            self.persist(session.clone());
        }
        metrics::callback("connect");
        Ok(Response::Continue)
    }

    async fn helo(
        &self,
        conn: ConnId,
        name: String,
        tls: Option<TlsFacts>,
    ) -> Result<Response, EngineError> {
        // libmilter has been seen delivering HELO with no connect context.
        let Some(session) = self.registry.lookup(conn) else {
            metrics::protocol_error();
            info!(
                %conn,
                "received HELO/EHLO midway conversation, status=Tempfail rcode=421 xcode=4.7.0"
            );
            return Ok(Response::temp_fail(HELO_OUT_OF_SEQUENCE));
        };

        let mut session = session.lock().await;
        debug!(session = session.id, helo = %name, "helo");
        session.helo = Some(name);
        if session.tls.is_none() {
            session.tls = tls;
        }
        self.persist(session.clone());
        metrics::callback("helo");
        Ok(Response::Continue)
    }

    async fn mail_from(&self, conn: ConnId, args: Vec<String>) -> Result<Response, EngineError> {
        let session = self.session(conn)?;
        let mut session = session.lock().await;

        if args.len() != 1 {
            metrics::protocol_error();
            error!(
                session = session.id,
                addresses = args.len(),
                "envelope-from did not carry exactly one address"
            );
        }
        let from = args.into_iter().next().unwrap_or_default();
        debug!(session = session.id, from = %from, "mail from");
        session.begin_message(from);
        metrics::callback("mail_from");
        Ok(Response::Continue)
    }

    async fn rcpt_to(&self, conn: ConnId, args: Vec<String>) -> Result<Response, EngineError> {
        let session = self.session(conn)?;
        let mut session = session.lock().await;
        let session_id = session.id;
        let message = session
            .current_message()
            .ok_or(EngineError::NoMessage { session: session_id })?;

        match args.into_iter().next() {
            Some(rcpt) => {
                debug!(session = session_id, rcpt = %rcpt, "rcpt to");
                message.rcpt.push(rcpt);
            }
            None => {
                metrics::protocol_error();
                warn!(session = session_id, "envelope-to carried no address");
            }
        }
        metrics::callback("rcpt_to");
        Ok(Response::Continue)
    }

    async fn header(
        &self,
        conn: ConnId,
        name: String,
        value: String,
    ) -> Result<Response, EngineError> {
        let session = self.session(conn)?;
        let mut session = session.lock().await;
        let session_id = session.id;
        let message = session
            .current_message()
            .ok_or(EngineError::NoMessage { session: session_id })?;

        debug!(session = session_id, header = %name, "header");
        message.headers.push(Header { name, value });
        metrics::callback("header");
        Ok(Response::Continue)
    }

    async fn end_of_headers(
        &self,
        conn: ConnId,
        sasl: Option<SaslFacts>,
        queue_id: String,
    ) -> Result<Response, EngineError> {
        let session = self.session(conn)?;
        let mut session = session.lock().await;
        if sasl.is_some() {
            session.sasl = sasl;
        }
        if let Some(message) = session.current_message() {
            if message.queue_id.is_empty() {
                message.queue_id = queue_id;
            }
        }
        debug!(session = session.id, "end of headers");
        metrics::callback("end_of_headers");
        Ok(Response::Continue)
    }

    async fn body(&self, conn: ConnId, chunk: Bytes) -> Result<Response, EngineError> {
        let session = self.session(conn)?;
        let mut session = session.lock().await;
        let session_id = session.id;
        let message = session
            .current_message()
            .ok_or(EngineError::NoMessage { session: session_id })?;

        debug!(session = session_id, bytes = chunk.len(), "body chunk");
        message.append_body(chunk);
        metrics::callback("body");
        Ok(Response::Continue)
    }

    /// Terminal event for the current message: hand the accumulated message to
    /// the policy and map its verdict onto the protocol response.
    async fn end_of_message(&self, conn: ConnId) -> Result<Response, EngineError> {
        let session = self.session(conn)?;
        let mut session = session.lock().await;
        let session_id = session.id;
        let idx = session
            .current_index()
            .ok_or(EngineError::NoMessage { session: session_id })?;
        metrics::callback("end_of_message");

        let judgement = self
            .policy
            .evaluate(&session, &session.messages()[idx])
            .await
            .map_err(|err| EngineError::Policy {
                message: err.to_string(),
            })?;
        session.finalize_current();

        let queue_id = session.messages()[idx].queue_id.clone();
        Ok(map_judgement(session_id, &queue_id, judgement))
    }

    async fn abort(&self, conn: ConnId) -> Result<Response, EngineError> {
        metrics::callback("abort");
        match self.registry.lookup(conn) {
            None => debug!(%conn, "abort with no session context"),
            Some(session) => {
                let mut session = session.lock().await;
                if session.abort_message() {
                    debug!(session = session.id, "aborted in-progress message");
                }
            }
        }
        Ok(Response::Continue)
    }

    async fn close(&self, conn: ConnId) -> Result<Response, EngineError> {
        metrics::callback("close");
        match self.registry.remove(conn) {
            None => debug!(%conn, "close with no session context"),
            Some(session) => {
                let mut session = session.lock().await;
                session.end();
                debug!(session = session.id, "close");
                self.persist(session.clone());
            }
        }
        Ok(Response::Continue)
    }

    fn session(&self, conn: ConnId) -> Result<SharedSession, EngineError> {
        self.registry
            .lookup(conn)
            .ok_or(EngineError::NoSession { conn })
    }

    /// Fire-and-forget persistence: never on the path that decides the
    /// protocol response.
    fn persist(&self, snapshot: Session) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(err) = sink.persist(snapshot).await {
                warn!(error = ?err, "session persist failed");
            }
        });
    }
}

fn map_judgement(session: u64, queue_id: &str, judgement: Judgement) -> Response {
    metrics::verdict(judgement.verdict.as_str());
    match judgement.verdict {
        Verdict::Permit => {
            info!(session, queue = queue_id, "message permit");
            Response::Continue
        }
        Verdict::TempFail => {
            info!(session, queue = queue_id, reason = %judgement.message, "message tempfail");
            Response::temp_fail(judgement.message)
        }
        Verdict::Reject => {
            info!(session, queue = queue_id, reason = %judgement.message, "message reject");
            Response::reject(judgement.message)
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use miette::{miette, Result};

    struct StaticPolicy {
        verdict: Verdict,
        message: &'static str,
    }

    #[async_trait]
    impl Policy for StaticPolicy {
        async fn evaluate(&self, _session: &Session, _message: &crate::Message) -> Result<Judgement> {
            Ok(Judgement::new(self.verdict, self.message))
        }
    }

    struct PanicPolicy;

    #[async_trait]
    impl Policy for PanicPolicy {
        async fn evaluate(&self, _session: &Session, _message: &crate::Message) -> Result<Judgement> {
            panic!("policy exploded");
        }
    }

    struct FailingPolicy;

    #[async_trait]
    impl Policy for FailingPolicy {
        async fn evaluate(&self, _session: &Session, _message: &crate::Message) -> Result<Judgement> {
            Err(miette!("scoring backend unavailable"))
        }
    }

    struct NullSink;

    #[async_trait]
    impl SessionSink for NullSink {
        async fn persist(&self, _snapshot: Session) -> Result<()> {
            Ok(())
        }
    }

    fn test_engine(policy: impl Policy + 'static) -> Engine {
        Engine::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(policy),
            Arc::new(NullSink),
        )
    }

    fn connect_event(hostname: &str, ip: &str) -> Event {
        Event::Connect {
            hostname: hostname.to_string(),
            address: Some(ip.parse().unwrap()),
        }
    }

    fn mail_from(addr: &str) -> Event {
        Event::MailFrom {
            args: vec![addr.to_string()],
        }
    }

    fn rcpt_to(addr: &str) -> Event {
        Event::RcptTo {
            args: vec![addr.to_string()],
        }
    }

    fn header(name: &str, value: &str) -> Event {
        Event::Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn body(chunk: &'static [u8]) -> Event {
        Event::Body {
            chunk: Bytes::from_static(chunk),
        }
    }

    fn eoh() -> Event {
        Event::EndOfHeaders {
            sasl: None,
            queue_id: "QID01".to_string(),
        }
    }

    #[tokio::test]
    async fn happy_path_permits_and_accumulates() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);

        let steps = [
            connect_event("mail.example", "192.0.2.1"),
            Event::Helo {
                name: "example.com".to_string(),
                tls: None,
            },
            mail_from("a@example.com"),
            rcpt_to("b@test.com"),
            header("Subject", "hi"),
            eoh(),
            body(b"hello"),
            Event::EndOfMessage,
        ];
        for step in steps {
            assert_eq!(engine.dispatch(conn, step).await, Response::Continue);
        }

        let session = engine.registry().lookup(conn).unwrap();
        let session = session.lock().await;
        assert_eq!(session.hostname, "mail.example");
        assert_eq!(session.helo.as_deref(), Some("example.com"));
        assert_eq!(session.messages().len(), 1);

        let message = &session.messages()[0];
        assert_eq!(message.from, "a@example.com");
        assert_eq!(message.rcpt, vec!["b@test.com".to_string()]);
        assert_eq!(message.headers.len(), 1);
        assert_eq!(message.headers[0].name, "Subject");
        assert_eq!(message.queue_id, "QID01");
        assert_eq!(message.body(), b"hello");
        assert!(message.is_finalized());
    }

    #[tokio::test]
    async fn reject_verdict_maps_to_550() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Reject,
            message: "blocked by policy",
        });
        let conn = ConnId::new(1);

        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;
        engine.dispatch(conn, mail_from("a@example.com")).await;
        let before = metrics::verdict_count("reject");
        let response = engine.dispatch(conn, Event::EndOfMessage).await;

        assert!(metrics::verdict_count("reject") >= before + 1);
        assert_eq!(response, Response::reject("blocked by policy"));
        match response {
            Response::Reject(reply) => {
                assert_eq!(reply.code, 550);
                assert_eq!(reply.enhanced, "5.7.1");
                assert_eq!(reply.smtp_line(), "550 5.7.1 blocked by policy");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tempfail_verdict_maps_to_421() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::TempFail,
            message: "greylisted, try again later",
        });
        let conn = ConnId::new(1);

        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;
        engine.dispatch(conn, mail_from("a@example.com")).await;
        let response = engine.dispatch(conn, Event::EndOfMessage).await;
        assert_eq!(response, Response::temp_fail("greylisted, try again later"));
    }

    #[tokio::test]
    async fn helo_before_connect_is_a_protocol_error() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let before = metrics::protocol_error_count();

        let response = engine
            .dispatch(
                ConnId::new(42),
                Event::Helo {
                    name: "example.com".to_string(),
                    tls: None,
                },
            )
            .await;

        assert_eq!(response, Response::temp_fail(HELO_OUT_OF_SEQUENCE));
        // The counter is process-global, so other tests may also bump it.
        assert!(metrics::protocol_error_count() >= before + 1);
        // No phantom session was created.
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn empty_envelope_from_degrades_without_panicking() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;

        let before = metrics::protocol_error_count();
        let response = engine.dispatch(conn, Event::MailFrom { args: vec![] }).await;
        assert_eq!(response, Response::Continue);
        assert!(metrics::protocol_error_count() >= before + 1);

        let session = engine.registry().lookup(conn).unwrap();
        let session = session.lock().await;
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].from, "");
    }

    #[tokio::test]
    async fn body_without_message_is_out_of_sequence() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;

        let before = metrics::protocol_error_count();
        let response = engine.dispatch(conn, body(b"stray")).await;
        assert_eq!(response, Response::temp_fail(OUT_OF_SEQUENCE));
        assert!(metrics::protocol_error_count() >= before + 1);
    }

    #[tokio::test]
    async fn pipelined_messages_stay_separate() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;

        engine.dispatch(conn, mail_from("first@example.com")).await;
        engine.dispatch(conn, rcpt_to("one@test.com")).await;
        engine.dispatch(conn, header("Subject", "first")).await;
        engine.dispatch(conn, body(b"first body")).await;
        engine.dispatch(conn, Event::EndOfMessage).await;

        engine.dispatch(conn, mail_from("second@example.com")).await;
        engine.dispatch(conn, rcpt_to("two@test.com")).await;
        engine.dispatch(conn, header("Subject", "second")).await;
        engine.dispatch(conn, body(b"second body")).await;
        engine.dispatch(conn, Event::EndOfMessage).await;

        let session = engine.registry().lookup(conn).unwrap();
        let session = session.lock().await;
        assert_eq!(session.messages().len(), 2);

        let first = &session.messages()[0];
        assert_eq!(first.from, "first@example.com");
        assert_eq!(first.rcpt, vec!["one@test.com".to_string()]);
        assert_eq!(first.body(), b"first body");

        let second = &session.messages()[1];
        assert_eq!(second.from, "second@example.com");
        assert_eq!(second.rcpt, vec!["two@test.com".to_string()]);
        assert_eq!(second.headers[0].value, "second");
        assert_eq!(second.body(), b"second body");
    }

    #[tokio::test]
    async fn duplicate_connect_replaces_and_is_flagged() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("first.example", "192.0.2.1")).await;

        let before = metrics::protocol_error_count();
        let response = engine
            .dispatch(conn, connect_event("second.example", "192.0.2.2"))
            .await;
        assert_eq!(response, Response::Continue);
        assert!(metrics::protocol_error_count() >= before + 1);

        // The fresh session wins and the stale one is gone from the registry.
        assert_eq!(engine.registry().len(), 1);
        let session = engine.registry().lookup(conn).unwrap();
        assert_eq!(session.lock().await.hostname, "second.example");
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;
        engine.dispatch(conn, mail_from("a@example.com")).await;

        assert_eq!(engine.dispatch(conn, Event::Abort).await, Response::Continue);
        assert_eq!(engine.dispatch(conn, Event::Abort).await, Response::Continue);

        let session = engine.registry().lookup(conn).unwrap();
        let session = session.lock().await;
        assert!(session.messages().is_empty());
        // The session itself survives an abort.
        assert!(session.ended_at.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_evicts() {
        let engine = test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        });
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;

        assert_eq!(engine.dispatch(conn, Event::Close).await, Response::Continue);
        assert!(engine.registry().is_empty());
        assert_eq!(engine.dispatch(conn, Event::Close).await, Response::Continue);
    }

    #[tokio::test]
    async fn panicking_policy_is_contained() {
        let engine = test_engine(PanicPolicy);
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;
        engine.dispatch(conn, mail_from("a@example.com")).await;

        let before = metrics::handler_failure_count();
        let response = engine.dispatch(conn, Event::EndOfMessage).await;
        assert_eq!(response, Response::temp_fail(INTERNAL_ERROR));
        assert!(metrics::handler_failure_count() >= before + 1);

        // The connection stays usable afterwards.
        assert_eq!(engine.dispatch(conn, Event::Close).await, Response::Continue);
    }

    #[tokio::test]
    async fn failing_policy_degrades_to_tempfail() {
        let engine = test_engine(FailingPolicy);
        let conn = ConnId::new(1);
        engine.dispatch(conn, connect_event("mail.example", "192.0.2.1")).await;
        engine.dispatch(conn, mail_from("a@example.com")).await;

        let before = metrics::handler_failure_count();
        let response = engine.dispatch(conn, Event::EndOfMessage).await;
        assert_eq!(response, Response::temp_fail(INTERNAL_ERROR));
        assert!(metrics::handler_failure_count() >= before + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connections_do_not_cross_contaminate() {
        let engine = Arc::new(test_engine(StaticPolicy {
            verdict: Verdict::Permit,
            message: "",
        }));

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let conn = ConnId::new(i);
                let hostname = format!("host-{i}.example");
                let from = format!("sender-{i}@example.com");
                let rcpt = format!("rcpt-{i}@test.com");
                let payload = format!("payload-{i}");

                engine
                    .dispatch(
                        conn,
                        Event::Connect {
                            hostname: hostname.clone(),
                            address: Some(format!("10.0.0.{i}").parse().unwrap()),
                        },
                    )
                    .await;
                engine
                    .dispatch(
                        conn,
                        Event::Helo {
                            name: format!("helo-{i}"),
                            tls: None,
                        },
                    )
                    .await;
                engine
                    .dispatch(conn, Event::MailFrom { args: vec![from.clone()] })
                    .await;
                engine
                    .dispatch(conn, Event::RcptTo { args: vec![rcpt.clone()] })
                    .await;
                engine
                    .dispatch(
                        conn,
                        Event::Body {
                            chunk: Bytes::from(payload.clone().into_bytes()),
                        },
                    )
                    .await;
                engine.dispatch(conn, Event::EndOfMessage).await;

                let session = engine.registry().lookup(conn).unwrap();
                let session = session.lock().await;
                assert_eq!(session.hostname, hostname);
                assert_eq!(session.helo.as_deref(), Some(format!("helo-{i}").as_str()));
                let message = &session.messages()[0];
                assert_eq!(message.from, from);
                assert_eq!(message.rcpt, vec![rcpt]);
                assert_eq!(message.body(), payload.as_bytes());
                drop(session);

                engine.dispatch(conn, Event::Close).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(engine.registry().is_empty());
    }
}
