//! Delivery rules: broadcast, private messages, presence sync and slash
//! commands.
//!
//! The router holds no state of its own beyond a handle to the [`Registry`].
//! Every operation runs on the task of the session that triggered it and
//! writes straight to the target sessions; fan-out to several targets runs
//! those writes concurrently.

use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use crate::{
    error::RouteError,
    protocol::{Command, HELP_TEXT, MSG_USAGE, ServerFrame},
    registry::Registry,
    session::{Session, SessionId},
};

#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sends `"<sender>: <text>"` to every session except the sender and
    /// returns how many sessions it reached.
    pub async fn broadcast_text(&self, sender: &Session, text: &str) -> usize {
        let Some(name) = sender.username() else {
            debug!(session = sender.id(), "ignoring chat from unregistered session");
            return 0;
        };
        let frame = ServerFrame::Broadcast {
            sender: name.to_string(),
            text: text.to_string(),
        };
        self.fan_out(&frame, Some(sender.id())).await
    }

    /// Sends `IMAGE:<payload>` to every session except the sender. The frame
    /// does not name the sender.
    pub async fn broadcast_image(&self, sender: &Session, payload: &str) -> usize {
        let frame = ServerFrame::BroadcastImage {
            payload: payload.to_string(),
        };
        self.fan_out(&frame, Some(sender.id())).await
    }

    pub async fn broadcast_notice(&self, text: &str, exclude: Option<SessionId>) -> usize {
        self.fan_out(&ServerFrame::SystemNotice(text.to_string()), exclude)
            .await
    }

    pub async fn send_private_text(
        &self,
        sender: &Session,
        recipient: &str,
        text: &str,
    ) -> Result<(), RouteError> {
        let name = sender.username().unwrap_or_default();
        self.deliver_private(
            sender,
            recipient,
            ServerFrame::PrivateText {
                sender: name.to_string(),
                text: text.to_string(),
            },
            ServerFrame::PrivateTextEcho {
                recipient: recipient.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }

    /// Relays an image payload to one user. The payload is passed through as
    /// received.
    pub async fn send_private_image(
        &self,
        sender: &Session,
        recipient: &str,
        payload: &str,
    ) -> Result<(), RouteError> {
        let name = sender.username().unwrap_or_default();
        self.deliver_private(
            sender,
            recipient,
            ServerFrame::PrivateImage {
                sender: name.to_string(),
                payload: payload.to_string(),
            },
            ServerFrame::PrivateImageEcho {
                recipient: recipient.to_string(),
                payload: payload.to_string(),
            },
        )
        .await
    }

    /// Publishes the registered usernames to every session, the listed
    /// users included.
    pub async fn sync_user_list(&self) -> usize {
        let frame = ServerFrame::UserListSync(self.registry.usernames());
        self.fan_out(&frame, None).await
    }

    /// Runs a slash command on behalf of `issuer`. Replies go to the issuer
    /// only, apart from `/msg` which behaves like a private message.
    pub async fn handle_command(&self, issuer: &Session, command: Command) -> Result<(), RouteError> {
        match command {
            Command::Users => {
                let names = self.registry.usernames().join(", ");
                issuer
                    .send(&ServerFrame::CommandReply(format!("USERLIST:{names}")))
                    .await;
                Ok(())
            }
            Command::Msg { recipient, text } => {
                self.send_private_text(issuer, &recipient, &text).await
            }
            Command::MsgUsage => {
                issuer
                    .send(&ServerFrame::ErrorNotice(MSG_USAGE.to_string()))
                    .await;
                Ok(())
            }
            Command::Help => {
                issuer
                    .send(&ServerFrame::CommandReply(HELP_TEXT.to_string()))
                    .await;
                Ok(())
            }
            Command::Unknown(command) => {
                let error = RouteError::UnknownCommand(command);
                issuer
                    .send(&ServerFrame::ErrorNotice(error.to_string()))
                    .await;
                Err(error)
            }
        }
    }

    async fn deliver_private(
        &self,
        sender: &Session,
        recipient: &str,
        delivery: ServerFrame,
        echo: ServerFrame,
    ) -> Result<(), RouteError> {
        let Some(target) = self.registry.lookup(recipient) else {
            let error = RouteError::UnknownRecipient(recipient.to_string());
            sender
                .send(&ServerFrame::ErrorNotice(error.to_string()))
                .await;
            return Err(error);
        };

        target.send(&delivery).await;
        sender.send(&echo).await;
        Ok(())
    }

    /// Writes `frame` to every tracked session except `exclude` and returns
    /// how many writes succeeded.
    async fn fan_out(&self, frame: &ServerFrame, exclude: Option<SessionId>) -> usize {
        let line = frame.to_string();
        let targets: Vec<Arc<Session>> = self
            .registry
            .sessions()
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .collect();

        let delivered = join_all(targets.iter().map(|session| session.send_line(&line)))
            .await
            .into_iter()
            .filter(|written| *written)
            .count();

        if delivered < targets.len() {
            debug!(
                delivered,
                targets = targets.len(),
                "some sessions missed a frame"
            );
        }
        delivered
    }
}
