use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use signbridge_lib::{
    call::Participant,
    config::Config,
    engine::{rtc::RtcEngine, Engine},
    media::SyntheticCapture,
    session::SessionOptions,
    store::{FileStore, MemoryStore},
    CallManager, CallSession, SessionState,
};
use tokio::{signal::ctrl_c, time::timeout};
use tracing::{info, warn};

async fn engine(config: &Config) -> Result<Engine> {
    RtcEngine::connect(&config.rtc, config.session.event_buffer).await
}

async fn wait_settled(session: &CallSession) -> SessionState {
    let mut state = session.watch_state();
    loop {
        let current = state.borrow_and_update().clone();
        if current == SessionState::Connected || current.is_terminal() {
            return current;
        }
        if state.changed().await.is_err() {
            return session.state();
        }
    }
}

/// Logs state changes until the call ends or Ctrl-C is pressed.
async fn run_until_end(session: &CallSession) -> Result<()> {
    let mut state = session.watch_state();
    loop {
        let current = state.borrow_and_update().clone();
        info!("call {}: {:?}", session.call_id(), current);
        if current.is_terminal() {
            return Ok(());
        }
        tokio::select! {
            signal = ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("interrupted");
                return Ok(());
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

pub async fn loopback(config: &Config, timeout_sec: u64) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let manager = CallManager::new(store, SessionOptions::from(config));
    let alice = Participant::new("alice".into(), "Alice".into());
    let bob = Participant::new("bob".into(), "Bob".into());

    let mut incoming = manager.incoming_calls(bob.id()).await?;
    let caller = manager
        .place_call(&alice, &bob, engine(config).await?, Box::new(SyntheticCapture::new()))
        .await?;
    let call = incoming.recv().await.context("invitation was not delivered")?;
    manager.ring(&call).await?;
    let callee = manager
        .accept(&call, engine(config).await?, Box::new(SyntheticCapture::new()))
        .await?;

    caller.on_ready().await?;
    callee.on_ready().await?;

    let settled = timeout(Duration::from_secs(timeout_sec), async {
        (wait_settled(&caller).await, wait_settled(&callee).await)
    })
    .await;

    manager.hang_up(&caller).await?;
    callee.disconnect().await?;

    match settled {
        Ok((SessionState::Connected, SessionState::Connected)) => {
            println!("loopback call {} connected", call.id());
            Ok(())
        }
        Ok((caller, callee)) => bail!("loopback failed: caller {:?}, callee {:?}", caller, callee),
        Err(_) => bail!("loopback did not connect within {} seconds", timeout_sec),
    }
}

fn file_store(config: &Config) -> Arc<FileStore> {
    let store = FileStore::from_config(&config.store);
    info!("call records in {}", store.path().display());
    Arc::new(store)
}

pub async fn call(config: &Config, from: (String, String), to: (String, String)) -> Result<()> {
    let store = file_store(config);
    let manager = CallManager::new(store, SessionOptions::from(config));
    let caller = Participant::new(from.0, from.1);
    let callee = Participant::new(to.0, to.1);

    let session = manager
        .place_call(&caller, &callee, engine(config).await?, Box::new(SyntheticCapture::new()))
        .await?;
    if let Err(err) = session.on_ready().await {
        warn!("negotiation failed: {}", err);
    }
    run_until_end(&session).await?;
    manager.hang_up(&session).await?;
    Ok(())
}

pub async fn answer(config: &Config, user: &str) -> Result<()> {
    let store = file_store(config);
    let manager = CallManager::new(store, SessionOptions::from(config));

    info!("waiting for a call to {}", user);
    let mut incoming = manager.incoming_calls(user).await?;
    let call = tokio::select! {
        call = incoming.recv() => call.context("incoming call stream ended")?,
        signal = ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            return Ok(());
        }
    };
    let caller = call.caller();
    info!("incoming call from {} <{}> ({})", caller.name(), caller.id(), call.id());
    manager.ring(&call).await?;

    let session = manager
        .accept(&call, engine(config).await?, Box::new(SyntheticCapture::new()))
        .await?;
    if let Err(err) = session.on_ready().await {
        warn!("negotiation failed: {}", err);
    }
    run_until_end(&session).await?;
    manager.hang_up(&session).await?;
    Ok(())
}
