//! Wire protocol: SLIP framing, command packets and the request/response channel.

pub mod channel;
pub mod command;
pub mod slip;

// Re-export common types
pub use channel::CommandChannel;
pub use command::{Command, CommandOutput, Opcode, Response, checksum, timeout_per_mb};
