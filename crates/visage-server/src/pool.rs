//! Fixed pool of pre-warmed session slots. Slots are handed out LIFO so a
//! recently released slot (hot caches, warm executor) is reused first;
//! fairness is not a goal.

use crate::config::ServerConfig;
use crate::session::SessionContext;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use visage_infer::InferError;

pub struct SessionPool {
    sessions: Vec<SessionContext>,
    free_indices: Mutex<Vec<usize>>,
}

impl SessionPool {
    /// Construct every slot eagerly; any failure aborts startup.
    pub fn init(config: &ServerConfig) -> Result<Self, InferError> {
        let mut sessions = Vec::with_capacity(config.max_sessions);
        for index in 0..config.max_sessions {
            let session = SessionContext::init(config).map_err(|err| {
                log::error!("Failed to init session {index}: {err}");
                err
            })?;
            sessions.push(session);
        }
        let free_indices = (0..config.max_sessions).collect();
        Ok(Self {
            sessions,
            free_indices: Mutex::new(free_indices),
        })
    }

    /// Pop a free slot, reset it, and bind it to `socket`. Non-blocking:
    /// returns None when the pool is exhausted or the reset fails.
    pub fn acquire(&self, socket: Arc<TcpStream>) -> Option<usize> {
        let index = self
            .free_indices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()?;

        if let Err(err) = self.sessions[index].reset_for_reuse() {
            log::error!("Session {index} reset failed: {err}");
            self.free_indices
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(index);
            return None;
        }
        self.sessions[index].start(socket);
        Some(index)
    }

    /// Detach the slot from its connection and return it to the free list.
    pub fn release(&self, index: usize) {
        if index >= self.sessions.len() {
            return;
        }
        self.sessions[index].stop();
        self.free_indices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(index);
    }

    /// Borrow a slot. The index is assumed valid.
    pub fn get(&self, index: usize) -> &SessionContext {
        &self.sessions[index]
    }

    pub fn capacity(&self) -> usize {
        self.sessions.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_indices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
