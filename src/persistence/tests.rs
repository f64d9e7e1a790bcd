use super::{SessionStore, SledStore};
use crate::broker::Message;
use crate::packet::QoS;
use crate::utils::StoreError;

use tempfile::tempdir;

fn store() -> SledStore {
    SledStore::temporary().unwrap()
}

#[test]
fn test_check_auth() {
    let store = store();
    store.save_user("alice", b"wonderland").unwrap();

    assert!(store.check_auth("alice", b"wonderland").is_ok());
    assert!(matches!(
        store.check_auth("alice", b"looking-glass"),
        Err(StoreError::BadCredentials(user)) if user == "alice"
    ));
    assert!(matches!(
        store.check_auth("bob", b"wonderland"),
        Err(StoreError::NotFound(user)) if user == "bob"
    ));
}

#[test]
fn test_save_user_replaces_password() {
    let store = store();
    store.save_user("alice", b"old").unwrap();
    store.save_user("alice", b"new").unwrap();

    assert!(store.check_auth("alice", b"old").is_err());
    assert!(store.check_auth("alice", b"new").is_ok());
}

#[test]
fn test_subscriptions_are_scoped_per_client() {
    let store = store();
    store.save_subscription("c1", "a/+", QoS::AtLeastOnce).unwrap();
    store.save_subscription("c1", "b/#", QoS::ExactlyOnce).unwrap();
    // shares a prefix with c1 but must not leak into it
    store.save_subscription("c10", "c", QoS::AtMostOnce).unwrap();

    let subs = store.fetch_subscriptions("c1").unwrap();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs.get("a/+"), Some(&QoS::AtLeastOnce));
    assert_eq!(subs.get("b/#"), Some(&QoS::ExactlyOnce));

    store.save_subscription("c1", "a/+", QoS::AtMostOnce).unwrap();
    let subs = store.fetch_subscriptions("c1").unwrap();
    assert_eq!(subs.get("a/+"), Some(&QoS::AtMostOnce));

    store.delete_subscription("c1", "a/+").unwrap();
    let subs = store.fetch_subscriptions("c1").unwrap();
    assert_eq!(subs.len(), 1);

    store.delete_subscriptions("c1").unwrap();
    assert!(store.fetch_subscriptions("c1").unwrap().is_empty());
    assert_eq!(store.fetch_subscriptions("c10").unwrap().len(), 1);
}

#[test]
fn test_retained_save_replace_delete() {
    let store = store();
    store
        .save_retain(&Message::new("home/temp", "20", QoS::AtLeastOnce, true))
        .unwrap();
    store
        .save_retain(&Message::new("home/temp", "21", QoS::AtMostOnce, true))
        .unwrap();
    store
        .save_retain(&Message::new("home/door", "open", QoS::AtMostOnce, true))
        .unwrap();

    let mut retained = store.fetch_all_retained().unwrap();
    retained.sort_by(|a, b| a.topic.cmp(&b.topic));
    assert_eq!(retained.len(), 2);
    assert_eq!(retained[1].topic, "home/temp");
    assert_eq!(retained[1].payload.as_ref(), b"21");

    store.delete_retain("home/temp").unwrap();
    let retained = store.fetch_all_retained().unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].topic, "home/door");
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let path = path.to_str().unwrap();

    {
        let store = SledStore::open(path).unwrap();
        store.save_user("alice", b"pw").unwrap();
        store.save_subscription("c1", "x/y", QoS::ExactlyOnce).unwrap();
        store
            .save_retain(&Message::new("x/y", "kept", QoS::AtLeastOnce, true))
            .unwrap();
    }

    let store = SledStore::open(path).unwrap();
    assert!(store.check_auth("alice", b"pw").is_ok());
    assert_eq!(
        store.fetch_subscriptions("c1").unwrap().get("x/y"),
        Some(&QoS::ExactlyOnce)
    );
    let retained = store.fetch_all_retained().unwrap();
    assert_eq!(retained, vec![Message::new("x/y", "kept", QoS::AtLeastOnce, true)]);
}
