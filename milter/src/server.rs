use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use miette::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{
    ClientCommand, CodecError, MilterCodec, ServerMessage, DEFAULT_MAX_FRAME, MILTER_VERSION,
};
use crate::engine::{Engine, Event};
use crate::metrics;
use crate::registry::ConnId;
use crate::session::{SaslFacts, TlsFacts};

/// Macro symbols announced by the MTA for the current connection.
///
/// The MTA sends these ahead of the callback they apply to; later
/// announcements overwrite earlier ones, which matches how sendmail and
/// postfix refresh per-stage macros.
#[derive(Debug, Default)]
struct MacroTable {
    symbols: HashMap<String, String>,
}

impl MacroTable {
    fn absorb(&mut self, symbols: Vec<(String, String)>) {
        for (name, value) in symbols {
            self.symbols.insert(name, value);
        }
    }

    fn get(&self, name: &str) -> &str {
        self.symbols.get(name).map(String::as_str).unwrap_or("")
    }

    /// TLS session facts, present once any of the TLS macros carries a value.
    fn tls_facts(&self) -> Option<TlsFacts> {
        let facts = TlsFacts {
            cert_issuer: self.get("{cert_issuer}").to_string(),
            cert_subject: self.get("{cert_subject}").to_string(),
            cipher: self.get("{cipher}").to_string(),
            cipher_bits: self.get("{cipher_bits}").to_string(),
            tls_version: self.get("{tls_version}").to_string(),
        };
        (facts != TlsFacts::default()).then_some(facts)
    }

    fn sasl_facts(&self) -> Option<SaslFacts> {
        let facts = SaslFacts {
            sender: self.get("{auth_author}").to_string(),
            method: self.get("{auth_type}").to_string(),
            username: self.get("{auth_authen}").to_string(),
        };
        (facts != SaslFacts::default()).then_some(facts)
    }

    fn queue_id(&self) -> String {
        self.get("i").to_string()
    }

    fn clear(&mut self) {
        self.symbols.clear();
    }
}

/// Accepts MTA connections and runs one milter conversation per connection.
pub struct MilterServer {
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    max_frame: usize,
    next_conn: AtomicU64,
}

impl MilterServer {
    pub fn new(engine: Arc<Engine>, shutdown: CancellationToken) -> Self {
        MilterServer {
            engine,
            shutdown,
            max_frame: DEFAULT_MAX_FRAME,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("milter listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    // Transient accept failures (EMFILE and friends) must not
                    // take the listener down.
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "failed to accept milter connection");
                            continue;
                        }
                    };
                    let conn = ConnId::new(self.next_conn.fetch_add(1, Ordering::Relaxed));
                    debug!(%conn, %peer, "accepted milter connection");

                    let engine = Arc::clone(&self.engine);
                    let max_frame = self.max_frame;
                    tokio::spawn(async move {
                        if let Err(err) = drive_connection(engine, conn, socket, max_frame).await {
                            warn!(%conn, error = %err, "milter connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// Runs one MTA conversation to completion.
///
/// Translates wire commands into engine events and relays the engine's
/// response. Macro, abort and quit packets expect no reply; everything else
/// gets exactly one.
async fn drive_connection<S>(
    engine: Arc<Engine>,
    conn: ConnId,
    socket: S,
    max_frame: usize,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, MilterCodec::new(max_frame));
    let mut macros = MacroTable::default();

    while let Some(frame) = framed.next().await {
        let command = match frame {
            Ok(command) => command,
            Err(err) => {
                metrics::protocol_error();
                engine.dispatch(conn, Event::Close).await;
                return Err(err);
            }
        };

        let event = match command {
            ClientCommand::OptNeg { version, .. } => {
                framed
                    .send(ServerMessage::OptNeg {
                        version: MILTER_VERSION.min(version),
                        actions: 0,
                        protocol: 0,
                    })
                    .await?;
                continue;
            }
            ClientCommand::Macro { symbols, .. } => {
                macros.absorb(symbols);
                continue;
            }
            // Neither carries transaction state the engine tracks.
            ClientCommand::Data | ClientCommand::Unknown(_) => {
                framed.send(ServerMessage::Continue).await?;
                continue;
            }
            ClientCommand::Abort => {
                engine.dispatch(conn, Event::Abort).await;
                continue;
            }
            ClientCommand::Quit => {
                engine.dispatch(conn, Event::Close).await;
                return Ok(());
            }
            ClientCommand::QuitNewConnection => {
                engine.dispatch(conn, Event::Close).await;
                macros.clear();
                continue;
            }
            ClientCommand::EndOfBody(trailing) => {
                if !trailing.is_empty() {
                    engine.dispatch(conn, Event::Body { chunk: trailing }).await;
                }
                Event::EndOfMessage
            }
            ClientCommand::Connect {
                hostname, address, ..
            } => Event::Connect { hostname, address },
            ClientCommand::Helo(name) => Event::Helo {
                name,
                tls: macros.tls_facts(),
            },
            ClientCommand::Mail(args) => Event::MailFrom { args },
            ClientCommand::Rcpt(args) => Event::RcptTo { args },
            ClientCommand::Header { name, value } => Event::Header { name, value },
            ClientCommand::EndOfHeaders => Event::EndOfHeaders {
                sasl: macros.sasl_facts(),
                queue_id: macros.queue_id(),
            },
            ClientCommand::Body(chunk) => Event::Body { chunk },
        };

        let response = engine.dispatch(conn, event).await;
        framed.send(ServerMessage::from(&response)).await?;
    }

    // The MTA dropped the socket without a quit packet.
    debug!(%conn, "milter connection closed without quit");
    engine.dispatch(conn, Event::Close).await;
    Ok(())
}
