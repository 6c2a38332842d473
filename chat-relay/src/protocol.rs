//! Line protocol spoken between chat clients and the relay.
//!
//! Every frame is a single UTF-8 line terminated by `\n`. Inbound lines are
//! classified into [`ClientFrame`] as soon as they are read so the session
//! loop can dispatch with an exhaustive match; outbound frames are built as
//! [`ServerFrame`] values and rendered through their `Display` impl.

use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const HANDSHAKE_PREFIX: &str = "USERNAME:";
pub const QUIT: &str = "/quit";
pub const HELP_TEXT: &str =
    "COMMANDS: /users (show online users), /msg username message (private message), /help (show this)";
pub const MSG_USAGE: &str = "Usage: /msg <user> <message>";

const PRIVATE_TEXT_PREFIX: &str = "MSG_PRIVATE:";
const PRIVATE_IMAGE_PREFIX: &str = "IMG_PRIVATE:";
const IMAGE_PREFIX: &str = "IMAGE:";

/// A line received from a client once its handshake has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Quit,
    Command(Command),
    PrivateText { recipient: String, text: String },
    PrivateImage { recipient: String, payload: String },
    BroadcastImage { payload: String },
    Chat { text: String },
    /// A tagged private frame that is missing its `<user>:` separator.
    Malformed { line: String },
}

impl ClientFrame {
    pub fn parse(line: &str) -> Self {
        if line == QUIT {
            return ClientFrame::Quit;
        }
        if line.starts_with('/') {
            return ClientFrame::Command(Command::parse(line));
        }
        if let Some(rest) = line.strip_prefix(PRIVATE_TEXT_PREFIX) {
            return match rest.split_once(':') {
                Some((recipient, text)) => ClientFrame::PrivateText {
                    recipient: recipient.to_string(),
                    text: text.to_string(),
                },
                None => ClientFrame::Malformed {
                    line: line.to_string(),
                },
            };
        }
        if let Some(rest) = line.strip_prefix(PRIVATE_IMAGE_PREFIX) {
            return match rest.split_once(':') {
                Some((recipient, payload)) => ClientFrame::PrivateImage {
                    recipient: recipient.to_string(),
                    payload: payload.to_string(),
                },
                None => ClientFrame::Malformed {
                    line: line.to_string(),
                },
            };
        }
        if let Some(payload) = line.strip_prefix(IMAGE_PREFIX) {
            return ClientFrame::BroadcastImage {
                payload: payload.to_string(),
            };
        }
        ClientFrame::Chat {
            text: line.to_string(),
        }
    }
}

/// Slash commands other than `/quit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Users,
    Msg { recipient: String, text: String },
    /// `/msg ` followed by a recipient but no message.
    MsgUsage,
    Help,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line {
            "/users" => return Command::Users,
            "/help" => return Command::Help,
            _ => {}
        }

        if line.starts_with("/msg ") {
            let mut parts = line.splitn(3, ' ').skip(1);
            return match (parts.next(), parts.next()) {
                (Some(recipient), Some(text)) if !recipient.is_empty() && !text.is_empty() => {
                    Command::Msg {
                        recipient: recipient.to_string(),
                        text: text.to_string(),
                    }
                }
                _ => Command::MsgUsage,
            };
        }

        Command::Unknown(line.to_string())
    }
}

/// Extracts the requested username from the first line of a connection.
///
/// Returns `None` when the line is not a `USERNAME:<name>` frame or the name
/// is empty.
pub fn parse_handshake(line: &str) -> Option<&str> {
    line.strip_prefix(HANDSHAKE_PREFIX)
        .filter(|name| !name.is_empty())
}

/// A line sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    SystemNotice(String),
    ErrorNotice(String),
    UserListSync(Vec<String>),
    /// Reply to a slash command, written verbatim.
    CommandReply(String),
    Broadcast { sender: String, text: String },
    BroadcastImage { payload: String },
    PrivateText { sender: String, text: String },
    PrivateTextEcho { recipient: String, text: String },
    PrivateImage { sender: String, payload: String },
    PrivateImageEcho { recipient: String, payload: String },
}

impl fmt::Display for ServerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerFrame::SystemNotice(text) => write!(f, "SYSTEM:{text}"),
            ServerFrame::ErrorNotice(text) => write!(f, "ERROR:{text}"),
            ServerFrame::UserListSync(names) => write!(f, "USERS_LIST:{}", names.join(",")),
            ServerFrame::CommandReply(text) => f.write_str(text),
            ServerFrame::Broadcast { sender, text } => write!(f, "{sender}: {text}"),
            ServerFrame::BroadcastImage { payload } => write!(f, "{IMAGE_PREFIX}{payload}"),
            ServerFrame::PrivateText { sender, text } => write!(f, "PRIVATE:{sender}:{text}"),
            ServerFrame::PrivateTextEcho { recipient, text } => {
                write!(f, "PRIVATE_TO:{recipient}:{text}")
            }
            ServerFrame::PrivateImage { sender, payload } => {
                write!(f, "IMAGE_PRIVATE:{sender}:{payload}")
            }
            ServerFrame::PrivateImageEcho { recipient, payload } => {
                write!(f, "IMAGE_PRIVATE_TO:{recipient}:{payload}")
            }
        }
    }
}

/// Reads one line, stripped of its terminator. `Ok(None)` means end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(LINE_ENDINGS).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // One buffer per frame so the newline never lands in a separate write.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
