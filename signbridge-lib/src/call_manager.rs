use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    call::{Call, CallStatus, CallUpdate, Participant},
    engine::Engine,
    error::{Error, Result},
    media::CaptureDevices,
    session::{CallSession, Role, SessionOptions},
    store::{CallRecords, MessageFeed, Store},
};

/// Places, accepts and ends calls, keeping the call records in step with the sessions.
pub struct CallManager {
    records: Arc<dyn CallRecords>,
    feed: Arc<dyn MessageFeed>,
    options: SessionOptions,
}

impl CallManager {
    pub fn new<S: Store>(store: Arc<S>, options: SessionOptions) -> Self {
        Self {
            records: store.clone(),
            feed: store,
            options,
        }
    }

    fn session(
        &self,
        call: &Call,
        role: Role,
        engine: Engine,
        devices: Box<dyn CaptureDevices>,
    ) -> CallSession {
        CallSession::new(
            call.id().clone(),
            role,
            self.feed.clone(),
            engine,
            devices,
            self.options.clone(),
        )
    }

    pub async fn place_call(
        &self,
        caller: &Participant,
        callee: &Participant,
        engine: Engine,
        devices: Box<dyn CaptureDevices>,
    ) -> Result<CallSession> {
        let call = Call::new(caller, callee);
        let call_id = self
            .records
            .create_call(call.clone())
            .await
            .map_err(Error::Records)?;
        info!("calling {} ({})", callee.name(), call_id);
        Ok(self.session(&call.with_id(call_id), Role::Initiator, engine, devices))
    }

    /// Tells the caller that the invitation reached the callee.
    pub async fn ring(&self, call: &Call) -> Result<bool> {
        self.records
            .update_call(call.id(), CallUpdate::status(CallStatus::Ringing))
            .await
            .map_err(Error::Records)
    }

    pub async fn accept(
        &self,
        call: &Call,
        engine: Engine,
        devices: Box<dyn CaptureDevices>,
    ) -> Result<CallSession> {
        let updated = self
            .records
            .update_call(call.id(), CallUpdate::status(CallStatus::Accepted))
            .await
            .map_err(Error::Records)?;
        if !updated {
            return Err(Error::Records(anyhow!("call {} no longer exists", call.id())));
        }
        info!("accepted call from {} ({})", call.caller_name(), call.id());
        Ok(self.session(call, Role::Responder, engine, devices))
    }

    pub async fn decline(&self, call: &Call) -> Result<()> {
        self.records
            .update_call(call.id(), CallUpdate::status(CallStatus::Rejected))
            .await
            .map_err(Error::Records)?;
        self.records
            .delete_call(call.id())
            .await
            .map_err(Error::Records)?;
        info!("declined call {}", call.id());
        Ok(())
    }

    /// Ends the session and removes the call record. A call that was never answered is
    /// recorded as cancelled.
    pub async fn hang_up(&self, session: &CallSession) -> Result<()> {
        session.disconnect().await?;

        let call_id = session.call_id();
        let Some(call) = self
            .records
            .find_call(call_id)
            .await
            .map_err(Error::Records)?
        else {
            debug!("call {} was already removed", call_id);
            return Ok(());
        };
        let now = Utc::now().timestamp_millis();
        let update = if call.status().is_pending() {
            CallUpdate {
                status: Some(CallStatus::Cancelled),
                end_time: Some(now),
                ..Default::default()
            }
        } else {
            CallUpdate::ended(now)
        };
        self.records
            .update_call(call_id, update)
            .await
            .map_err(Error::Records)?;
        self.records
            .delete_call(call_id)
            .await
            .map_err(Error::Records)?;
        info!("hung up call {}", call_id);
        Ok(())
    }

    pub async fn incoming_calls(&self, user_id: &str) -> Result<mpsc::UnboundedReceiver<Call>> {
        self.records
            .incoming_calls_for(user_id)
            .await
            .map_err(Error::Records)
    }
}
