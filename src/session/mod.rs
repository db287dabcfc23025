//! Sender and receiver orchestration
//!
//! Both sessions are driven from a control thread through non-blocking
//! calls and expose their progress as a polled [`Status`].

pub mod receiver;
pub mod sender;
pub mod state;

pub use receiver::{ConnectTarget, DriverFactory, ReceiverSession};
pub use sender::SenderSession;
pub use state::{ConnectionState, Status, StatusCell, StreamingState};
