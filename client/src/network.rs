use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use shared::{Params, ProtocolError, Request, Response, COMMAND_TIMEOUT};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connection closed by server")]
    Closed,
    #[error("no response to {command} within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("unreadable server message: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Operator-side connection to the command center.
///
/// Replies are matched to requests by id. Broadcasts that arrive while a
/// request is outstanding are queued and handed out by `next_message`.
pub struct ControlClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    backlog: VecDeque<Response>,
    next_id: u64,
    timeout: Duration,
}

impl ControlClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        info!("Connecting to {}", url);
        let (stream, _) = connect_async(url).await?;
        info!("Connected to {}", url);

        Ok(Self {
            stream,
            backlog: VecDeque::new(),
            next_id: 1,
            timeout: COMMAND_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a command and waits for the response carrying its id.
    pub async fn request(
        &mut self,
        command: &str,
        params: Params,
    ) -> Result<Response, ClientError> {
        let id = Value::String(format!("console-{}", self.next_id));
        self.next_id += 1;

        let mut request = Request::new(command, id.clone());
        request.params = params;
        debug!("→ {}", command);
        self.stream.send(Message::Text(request.to_json())).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let frame = timeout_at(deadline, read_response(&mut self.stream))
                .await
                .map_err(|_| ClientError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })?;

            match frame? {
                Some(response) if response.id == id => return Ok(response),
                Some(response) => self.backlog.push_back(response),
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Next message not consumed by `request`, typically a broadcast.
    /// `None` once the server has closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<Response>, ClientError> {
        if let Some(response) = self.backlog.pop_front() {
            return Ok(Some(response));
        }
        read_response(&mut self.stream).await
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_response(
    stream: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<Option<Response>, ClientError> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(Response::parse(&text)?)),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => return Ok(Some(Response::parse(&text)?)),
                Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
            },
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    info!("Server closed connection: {}", frame.reason);
                }
                return Ok(None);
            }
            _ => {}
        }
    }
    Ok(None)
}
