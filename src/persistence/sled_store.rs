//! Session store backed by `sled`
//!
//! Three trees are used:
//! - `users`: username -> hex encoded sha256 of the password
//! - `subscriptions`: `client_id \0 filter` -> granted QoS byte
//! - `retained`: topic -> JSON encoded [`Message`]
//!
//! Client ids and filters never contain NUL (the codec rejects it), so the
//! separator keeps one client's keys from prefixing another's.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use sled::{Db, Tree};

use super::SessionStore;
use crate::broker::Message;
use crate::packet::QoS;
use crate::utils::StoreError;

const USERS: &str = "users";
const SUBSCRIPTIONS: &str = "subscriptions";
const RETAINED: &str = "retained";

#[derive(Clone)]
pub struct SledStore {
    users: Tree,
    subscriptions: Tree,
    retained: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// A store that lives only as long as the process. Used by tests.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            users: db.open_tree(USERS)?,
            subscriptions: db.open_tree(SUBSCRIPTIONS)?,
            retained: db.open_tree(RETAINED)?,
        })
    }
}

fn hash_password(password: &[u8]) -> String {
    hex::encode(Sha256::digest(password))
}

fn client_prefix(client_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(0);
    prefix
}

fn subscription_key(client_id: &str, filter: &str) -> Vec<u8> {
    let mut key = client_prefix(client_id);
    key.extend_from_slice(filter.as_bytes());
    key
}

impl SessionStore for SledStore {
    fn check_auth(&self, username: &str, password: &[u8]) -> Result<(), StoreError> {
        let stored = self
            .users
            .get(username.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;

        if stored.as_ref() != hash_password(password).as_bytes() {
            return Err(StoreError::BadCredentials(username.to_string()));
        }
        Ok(())
    }

    fn save_user(&self, username: &str, password: &[u8]) -> Result<(), StoreError> {
        self.users
            .insert(username.as_bytes(), hash_password(password).as_bytes())?;
        self.users.flush()?;
        Ok(())
    }

    fn save_subscription(&self, client_id: &str, filter: &str, qos: QoS) -> Result<(), StoreError> {
        self.subscriptions
            .insert(subscription_key(client_id, filter), vec![qos as u8])?;
        Ok(())
    }

    fn delete_subscription(&self, client_id: &str, filter: &str) -> Result<(), StoreError> {
        self.subscriptions
            .remove(subscription_key(client_id, filter))?;
        Ok(())
    }

    fn delete_subscriptions(&self, client_id: &str) -> Result<(), StoreError> {
        let keys: Vec<_> = self
            .subscriptions
            .scan_prefix(client_prefix(client_id))
            .keys()
            .collect::<Result<_, _>>()?;

        for key in keys {
            self.subscriptions.remove(key)?;
        }
        Ok(())
    }

    fn fetch_subscriptions(&self, client_id: &str) -> Result<HashMap<String, QoS>, StoreError> {
        let prefix = client_prefix(client_id);
        let mut subscriptions = HashMap::new();

        for entry in self.subscriptions.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let filter = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let qos = value
                .first()
                .and_then(|b| QoS::try_from(*b).ok())
                .unwrap_or_default();
            subscriptions.insert(filter, qos);
        }

        Ok(subscriptions)
    }

    fn save_retain(&self, message: &Message) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(message)?;
        self.retained.insert(message.topic.as_bytes(), serialized)?;
        Ok(())
    }

    fn delete_retain(&self, topic: &str) -> Result<(), StoreError> {
        self.retained.remove(topic.as_bytes())?;
        Ok(())
    }

    fn fetch_all_retained(&self) -> Result<Vec<Message>, StoreError> {
        self.retained
            .iter()
            .values()
            .map(|value| -> Result<Message, StoreError> { Ok(serde_json::from_slice(&value?)?) })
            .collect()
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("retained", &self.retained.len())
            .finish()
    }
}
