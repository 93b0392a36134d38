mod common;

use std::{sync::Arc, time::Duration};

use common::{wait_for_state, FakeEngine, RecordingDevices};
use signbridge_lib::{
    call::{CallStatus, Participant},
    session::{Role, SessionOptions, SessionState},
    store::{CallRecords, FileStore, MemoryStore, Store},
    CallManager,
};

fn alice() -> Participant {
    Participant::new("alice".to_owned(), "Alice".to_owned())
}

fn bob() -> Participant {
    Participant::new("bob".to_owned(), "Bob".to_owned())
}

async fn full_call<S: Store>(caller_store: Arc<S>, callee_store: Arc<S>) {
    let caller_side = CallManager::new(caller_store.clone(), SessionOptions::default());
    let callee_side = CallManager::new(callee_store.clone(), SessionOptions::default());

    let mut incoming = callee_side.incoming_calls("bob").await.unwrap();
    let (_, engine) = FakeEngine::new("alice");
    let (_, devices) = RecordingDevices::new();
    let caller = caller_side
        .place_call(&alice(), &bob(), engine, devices)
        .await
        .unwrap();
    assert_eq!(caller.role(), Role::Initiator);

    let call = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.id(), caller.call_id());
    assert_eq!(call.caller_name(), "Alice");
    assert_eq!(call.status(), CallStatus::Calling);
    assert!(callee_side.ring(&call).await.unwrap());

    let (_, engine) = FakeEngine::new("bob");
    let (_, devices) = RecordingDevices::new();
    let callee = callee_side.accept(&call, engine, devices).await.unwrap();
    assert_eq!(callee.role(), Role::Responder);
    let record = callee_store.find_call(call.id()).await.unwrap().unwrap();
    assert_eq!(record.status(), CallStatus::Accepted);

    caller.on_ready().await.unwrap();
    callee.on_ready().await.unwrap();
    wait_for_state(&caller, SessionState::Connected).await;
    wait_for_state(&callee, SessionState::Connected).await;

    caller_side.hang_up(&caller).await.unwrap();
    assert_eq!(caller.state(), SessionState::Ended);
    assert!(caller_store.find_call(call.id()).await.unwrap().is_none());

    // The peer learns about the end through the feed and may hang up a removed call.
    wait_for_state(&callee, SessionState::Ended).await;
    callee_side.hang_up(&callee).await.unwrap();
}

#[tokio::test]
async fn call_over_memory_store() {
    let store = Arc::new(MemoryStore::new());
    full_call(store.clone(), store).await;
}

#[tokio::test]
async fn call_over_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let caller_store = Arc::new(FileStore::new(&path, Duration::from_millis(10)));
    let callee_store = Arc::new(FileStore::new(&path, Duration::from_millis(10)));
    full_call(caller_store, callee_store).await;
}

#[tokio::test]
async fn declined_call_is_removed() {
    let store = Arc::new(MemoryStore::new());
    let manager = CallManager::new(store.clone(), SessionOptions::default());
    let mut incoming = manager.incoming_calls("bob").await.unwrap();

    let (_, engine) = FakeEngine::new("alice");
    let (_, devices) = RecordingDevices::new();
    let caller = manager
        .place_call(&alice(), &bob(), engine, devices)
        .await
        .unwrap();
    let call = incoming.recv().await.unwrap();
    manager.decline(&call).await.unwrap();
    assert!(store.find_call(caller.call_id()).await.unwrap().is_none());

    let (_, engine) = FakeEngine::new("bob");
    let (_, devices) = RecordingDevices::new();
    assert!(manager.accept(&call, engine, devices).await.is_err());
    assert!(incoming.try_recv().is_err());
}

#[tokio::test]
async fn calls_for_other_users_are_not_reported() {
    let store = Arc::new(MemoryStore::new());
    let manager = CallManager::new(store, SessionOptions::default());
    let mut incoming = manager.incoming_calls("carol").await.unwrap();

    let (_, engine) = FakeEngine::new("alice");
    let (_, devices) = RecordingDevices::new();
    let caller = manager
        .place_call(&alice(), &bob(), engine, devices)
        .await
        .unwrap();
    assert!(incoming.try_recv().is_err());
    manager.hang_up(&caller).await.unwrap();
}
