//! Collaborators the chat core calls but does not own.

pub mod nickname;
pub mod sanitize;
