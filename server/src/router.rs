//! Command name → handler dispatch

use crate::error::CommandError;
use crate::transport::{ConnectionId, Outbox};
use futures_util::future::BoxFuture;
use log::{debug, error, warn};
use serde_json::Value;
use shared::{generate_message_id, Params, Request, Response};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type CommandHandler = Arc<dyn Fn(CommandContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything a handler needs to serve one request.
pub struct CommandContext {
    pub connection: ConnectionId,
    /// Echoed back verbatim in the response
    pub request_id: Value,
    pub params: Params,
    outbox: Arc<dyn Outbox>,
}

impl CommandContext {
    pub fn new(
        connection: ConnectionId,
        request_id: Value,
        params: Params,
        outbox: Arc<dyn Outbox>,
    ) -> Self {
        Self {
            connection,
            request_id,
            params,
            outbox,
        }
    }

    /// Sends a success envelope carrying `data` to the requesting
    /// connection. Returns false if the connection is gone.
    pub fn reply_success(&self, data: Value) -> bool {
        send_response(
            self.outbox.as_ref(),
            self.connection,
            &Response::success(self.request_id.clone(), data),
        )
    }

    pub fn reply_error(&self, message: impl Into<String>) -> bool {
        send_response(
            self.outbox.as_ref(),
            self.connection,
            &Response::error(self.request_id.clone(), message),
        )
    }

    /// Replies with `data` on success, or with the error's display text.
    pub fn reply(&self, result: Result<Value, CommandError>) -> bool {
        match result {
            Ok(data) => self.reply_success(data),
            Err(e) => {
                debug!("Command from connection {} failed: {}", self.connection, e);
                self.reply_error(e.to_string())
            }
        }
    }
}

/// What `dispatch` did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(String),
    Malformed(String),
    UnknownCommand(String),
}

/// Maps command names to handlers and dispatches parsed frames to them.
///
/// Handlers run on the reader task of the connection that sent the frame.
/// That connection's next frame is read only after the handler finishes.
pub struct CommandRouter {
    handlers: HashMap<String, CommandHandler>,
    outbox: Arc<dyn Outbox>,
}

impl CommandRouter {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self {
            handlers: HashMap::new(),
            outbox,
        }
    }

    /// Registers `handler` for `name`, replacing any earlier registration.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handler: CommandHandler =
            Arc::new(move |ctx| -> BoxFuture<'static, ()> { Box::pin(handler(ctx)) });
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!("Replaced handler for {}", name);
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Parses one frame and runs the matching handler to completion.
    ///
    /// Malformed frames and unknown commands are answered with an error
    /// response here; otherwise the handler is responsible for replying.
    pub async fn dispatch(&self, connection: ConnectionId, raw: &str) -> DispatchOutcome {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request from connection {}: {}", connection, e);
                let id = Request::extract_id(raw)
                    .unwrap_or_else(|| Value::String(generate_message_id()));
                send_response(
                    self.outbox.as_ref(),
                    connection,
                    &Response::error(id, e.to_string()),
                );
                return DispatchOutcome::Malformed(e.to_string());
            }
        };

        let Some(handler) = self.handlers.get(&request.command).cloned() else {
            warn!(
                "Unknown command {} from connection {}",
                request.command, connection
            );
            send_response(
                self.outbox.as_ref(),
                connection,
                &Response::error(request.id, format!("Unknown command: {}", request.command)),
            );
            return DispatchOutcome::UnknownCommand(request.command);
        };

        debug!("Connection {} → {}", connection, request.command);
        let ctx = CommandContext::new(
            connection,
            request.id,
            request.params,
            Arc::clone(&self.outbox),
        );
        handler(ctx).await;
        DispatchOutcome::Handled(request.command)
    }
}

/// Serialises and queues a response. Failures are logged, never returned.
pub fn send_response(outbox: &dyn Outbox, connection: ConnectionId, response: &Response) -> bool {
    match response.to_json() {
        Ok(text) => outbox.send(connection, text),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            false
        }
    }
}

/// Serialises and broadcasts a message. Returns the number of recipients.
pub fn broadcast_response(outbox: &dyn Outbox, response: &Response) -> usize {
    match response.to_json() {
        Ok(text) => outbox.broadcast(text),
        Err(e) => {
            error!("Failed to encode broadcast: {}", e);
            0
        }
    }
}
