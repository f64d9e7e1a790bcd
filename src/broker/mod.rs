pub mod engine;
pub mod message;
pub mod session;
pub mod topic;

pub use engine::{ConnectOutcome, Engine, Event, EventSender};
pub use message::Message;
pub use session::{ClientSession, ConnectionId, Outbound};
