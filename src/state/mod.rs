//! The connection-side registry of what this client has told the broker it
//! owns: sessions, their consumers/producers, open transactions, and
//! temporary destinations. A failover transport replays this tree against a
//! freshly (re)connected broker in parent-before-child order; nothing in
//! this crate's session/consumer/producer runtime reads it directly.

mod connection;
mod session;
mod transaction;

pub use connection::{ConnectionState, ConnectionStateTracker};
pub use session::{ConsumerState, ProducerState, SessionState};
pub use transaction::TransactionState;
