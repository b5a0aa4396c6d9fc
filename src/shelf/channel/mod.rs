//! Message plumbing shared by every endpoint in the host

pub mod mailbox;
pub mod protocol;

pub use mailbox::{Address, Inbox, Mailbox, Recipient, Routed};
pub use protocol::{
    Delivery, FaultReport, FaultStage, LifecycleCommand, MessageKind, ShelfMessage, UnloadReason,
};
