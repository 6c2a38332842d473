use std::io;

use thiserror::Error;

/// Why a connection ended before or outside the normal quit path.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection did not open with a USERNAME frame")]
    Handshake,
    #[error("username '{0}' is already taken")]
    DuplicateUsername(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("username '{0}' is already registered")]
    UsernameTaken(String),
}

/// Routing failures reported back to the issuing client.
///
/// The `Display` text is what the client sees after `ERROR:`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("User {0} is not online.")]
    UnknownRecipient(String),
    #[error("Unknown command. Type /help for available commands.")]
    UnknownCommand(String),
}
