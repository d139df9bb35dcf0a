//! Outbound (`/connect`) sessions.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{Message, MessageKind, NAME_PROMPT};
use crate::config::SessionConfig;
use crate::server::{
    Direction, DisplaySender, Frame, Session, SessionReader, SessionRegistry,
};
use crate::{PeerchatError, Result};

/// Connect to a relay server as `name` and start receiving from it.
///
/// Returns once the server has accepted the name. On any failure,
/// including a refused name, the registry is left unchanged.
pub async fn connect(
    host: &str,
    port: u16,
    name: &str,
    config: &SessionConfig,
    registry: &Arc<SessionRegistry>,
    display: DisplaySender,
    cancel: CancellationToken,
) -> Result<Session> {
    let addr = format!("{host}:{port}");
    debug!("Connecting to {}", addr);

    let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(PeerchatError::Connect {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(PeerchatError::Connect {
                addr,
                reason: format!("timed out after {:?}", config.connect_timeout()),
            })
        }
    };

    let (session, mut reader) = Session::open(stream, Direction::Outbound, config, cancel)?;
    if registry.contains(session.id()).await {
        session.close();
        return Err(PeerchatError::Connect {
            addr,
            reason: format!("already connected to {}", session.id()),
        });
    }

    let greeting = match tokio::time::timeout(
        config.connect_timeout(),
        introduce(&session, &mut reader, name),
    )
    .await
    {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            session.close();
            let reason = match e {
                PeerchatError::Validation(reason) => reason,
                other => other.to_string(),
            };
            return Err(PeerchatError::Connect { addr, reason });
        }
        Err(_) => {
            session.close();
            return Err(PeerchatError::Connect {
                addr,
                reason: "server did not accept a name in time".to_string(),
            });
        }
    };

    if let Err(e) = registry.register(session.clone()).await {
        session.close();
        return Err(PeerchatError::Connect {
            addr,
            reason: e.to_string(),
        });
    }

    info!("Connected to {} as {}", session.id(), name);
    show_frame(&display, session.id(), greeting);
    tokio::spawn(receive_loop(
        Arc::clone(registry),
        session.clone(),
        reader,
        display,
    ));
    Ok(session)
}

/// Send our name and wait for the server to take it.
///
/// Returns the first frame that is not a name prompt. A system message
/// that repeats the prompt after a reason is a refusal, reported as
/// `Validation` with that reason.
async fn introduce(session: &Session, reader: &mut SessionReader, name: &str) -> Result<Frame> {
    session.send_input(name).await?;
    loop {
        let frame = match reader.recv().await {
            Some(frame) => frame?,
            None => {
                return Err(PeerchatError::Protocol(
                    "server closed the connection".to_string(),
                ))
            }
        };
        if let Frame::Relay(message) = &frame {
            if message.kind == MessageKind::System {
                if message.payload == NAME_PROMPT {
                    continue;
                }
                if let Some(reason) = message.payload.strip_suffix(NAME_PROMPT) {
                    return Err(PeerchatError::Validation(reason.trim_end().to_string()));
                }
            }
        }
        return Ok(frame);
    }
}

fn show_frame(display: &DisplaySender, id: &str, frame: Frame) {
    let message = match frame {
        Frame::Relay(message) => message,
        // A server that does not attribute its lines; show them as its own.
        Frame::Input(line) => Message::chat(id, line),
    };
    let _ = display.send(message);
}

async fn receive_loop(
    registry: Arc<SessionRegistry>,
    session: Session,
    mut reader: SessionReader,
    display: DisplaySender,
) {
    let id = session.id().to_string();

    let reason = loop {
        match reader.recv().await {
            Some(Ok(frame)) => show_frame(&display, &id, frame),
            Some(Err(e)) => {
                warn!("Closing connection to {}: {}", id, e);
                break e.to_string();
            }
            None if session.is_open() => break "server closed the connection".to_string(),
            None => break "closed".to_string(),
        }
    };

    // A newer connection to the same server may already hold the id.
    registry.unregister_session(&session).await;
    info!("Disconnected from {} ({})", id, reason);
    let _ = display.send(Message::system(format!(
        "Disconnected from {id} ({reason})"
    )));
}
