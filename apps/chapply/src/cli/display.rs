//! User-facing terminal output.
//!
//! Command handlers report outcomes as a [`Message`] tagged with a
//! [`MessageType`]; the `show_message!` macro renders them with a
//! consistent `Action | details` layout.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Info,
    Success,
    Warning,
    Error,
    Highlight,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub action: String,
    pub details: String,
}

impl Message {
    pub fn new(action: String, details: String) -> Self {
        Self { action, details }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.action.is_empty() {
            write!(f, "{}", self.details)
        } else {
            write!(f, "{} | {}", self.action, self.details)
        }
    }
}

pub fn show_message_wrapper(message_type: MessageType, message: Message) {
    match message_type {
        MessageType::Error | MessageType::Warning => eprintln!("{message}"),
        _ => println!("{message}"),
    }
}

macro_rules! show_message {
    ($message_type:expr, $message:expr) => {
        $crate::cli::display::show_message_wrapper($message_type, $message)
    };
}
