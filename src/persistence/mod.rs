//! The `persistence` module stores the state that has to outlive a broker
//! process: user credentials, the subscriptions of persistent sessions, and
//! retained messages.
//!
//! The engine talks to it through the [`SessionStore`] trait. The shipped
//! implementation uses `sled` as an embedded key-value store.

pub mod sled_store;

use std::collections::HashMap;

use crate::broker::Message;
use crate::packet::QoS;
use crate::utils::StoreError;

pub use sled_store::SledStore;

/// Storage the engine needs for credentials, sessions and retained messages.
pub trait SessionStore: Send {
    /// Succeeds when `username` exists and `password` matches its stored hash.
    fn check_auth(&self, username: &str, password: &[u8]) -> Result<(), StoreError>;

    /// Creates or replaces a user.
    fn save_user(&self, username: &str, password: &[u8]) -> Result<(), StoreError>;

    fn save_subscription(&self, client_id: &str, filter: &str, qos: QoS) -> Result<(), StoreError>;

    fn delete_subscription(&self, client_id: &str, filter: &str) -> Result<(), StoreError>;

    /// Removes every stored subscription of `client_id`.
    fn delete_subscriptions(&self, client_id: &str) -> Result<(), StoreError>;

    fn fetch_subscriptions(&self, client_id: &str) -> Result<HashMap<String, QoS>, StoreError>;

    /// Creates or replaces the retained message for `message.topic`.
    fn save_retain(&self, message: &Message) -> Result<(), StoreError>;

    fn delete_retain(&self, topic: &str) -> Result<(), StoreError>;

    fn fetch_all_retained(&self) -> Result<Vec<Message>, StoreError>;
}

#[cfg(test)]
mod tests;
