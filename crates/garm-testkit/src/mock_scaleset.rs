//! Scripted scale-set session service.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use garm_forge::ForgeError;
use garm_scaleset::{ScaleSetApi, ScaleSetMessage, ScaleSetSession};
use tokio::sync::Notify;

#[derive(Default)]
struct ApiState {
    sessions_created: u32,
    sessions_deleted: u32,
    queue: VecDeque<ScaleSetMessage>,
    pub acked: Vec<i64>,
    pub acquired: Vec<i64>,
    /// Answer the next poll with a session error (forces re-acquire).
    invalidate_next_poll: bool,
}

#[derive(Default)]
pub struct MockScaleSetApi {
    state: Mutex<ApiState>,
    wakeup: Notify,
}

impl MockScaleSetApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for the long-poll loop.
    pub fn push_message(&self, message: ScaleSetMessage) {
        self.state.lock().unwrap().queue.push_back(message);
        self.wakeup.notify_waiters();
    }

    pub fn invalidate_next_poll(&self) {
        self.state.lock().unwrap().invalidate_next_poll = true;
        self.wakeup.notify_waiters();
    }

    pub fn acked(&self) -> Vec<i64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn acquired(&self) -> Vec<i64> {
        self.state.lock().unwrap().acquired.clone()
    }

    pub fn sessions_created(&self) -> u32 {
        self.state.lock().unwrap().sessions_created
    }

    pub fn sessions_deleted(&self) -> u32 {
        self.state.lock().unwrap().sessions_deleted
    }
}

#[async_trait]
impl ScaleSetApi for MockScaleSetApi {
    async fn create_session(&self, scale_set_id: i64) -> Result<ScaleSetSession, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.sessions_created += 1;
        Ok(ScaleSetSession {
            session_id: format!("sess-{}-{}", scale_set_id, state.sessions_created),
            message_queue_url: "mock://queue".into(),
            token: "sess-token".into(),
        })
    }

    async fn get_message(
        &self,
        _session: &ScaleSetSession,
        last_message_id: i64,
        wait: Duration,
    ) -> Result<Option<ScaleSetMessage>, ForgeError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.invalidate_next_poll {
                    state.invalidate_next_poll = false;
                    return Err(ForgeError::Conflict("mock: session superseded".into()));
                }
                while let Some(front) = state.queue.front() {
                    if front.message_id <= last_message_id {
                        state.queue.pop_front();
                        continue;
                    }
                    return Ok(state.queue.pop_front());
                }
            }
            if tokio::time::timeout_at(deadline, self.wakeup.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack_message(
        &self,
        _session: &ScaleSetSession,
        message_id: i64,
    ) -> Result<(), ForgeError> {
        self.state.lock().unwrap().acked.push(message_id);
        Ok(())
    }

    async fn acquire_jobs(
        &self,
        _session: &ScaleSetSession,
        _scale_set_id: i64,
        request_ids: &[i64],
    ) -> Result<Vec<i64>, ForgeError> {
        let mut state = self.state.lock().unwrap();
        state.acquired.extend_from_slice(request_ids);
        Ok(request_ids.to_vec())
    }

    async fn delete_session(&self, _session: &ScaleSetSession) -> Result<(), ForgeError> {
        self.state.lock().unwrap().sessions_deleted += 1;
        Ok(())
    }
}
