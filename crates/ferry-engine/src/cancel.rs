//! Cancellation coordinator.
//!
//! Cancelling exchange `K` locally stops our side of it and asks the peer to
//! stop theirs. The request travels as a `cancel_request` envelope under a
//! fresh key with `K` as its content; the peer answers with a
//! `cancel_response` under that same fresh key, which resolves the caller's
//! confirmation exchange.

use std::time::Instant;

use ferry_core::{Action, Envelope, Key};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::exchange::Notify;

/// Reply code for a cancel request whose content is not a key.
pub const BAD_KEY: &str = "bad_key";

impl Engine {
    /// Cancel `key` on both ends. `confirm` resolves with the peer's
    /// cancel-response envelope. Returns the key the request went out under.
    pub fn cancel(&mut self, key: Key, confirm: Option<Notify>, now: Instant) -> Result<Key, EngineError> {
        let request_key = Key::generate();
        self.cancel_under(key, request_key, confirm, now)?;
        Ok(request_key)
    }

    /// As [`Engine::cancel`], with the request going out under a key the
    /// caller picked, typically the key of its confirmation exchange.
    pub fn cancel_under(
        &mut self,
        key: Key,
        request_key: Key,
        confirm: Option<Notify>,
        now: Instant,
    ) -> Result<(), EngineError> {
        let released = self.release(key, now);
        tracing::info!(%key, request = %request_key, released, "cancelling exchange");

        let request = Envelope::new(Action::CancelRequest, Some(key.to_string()), request_key);
        self.send_envelope(&request, confirm, now)
    }

    /// Peer-side half: mirror the release for the named key and confirm
    /// under the request's key.
    pub(crate) fn handle_cancel_request(&mut self, request: &Envelope, now: Instant) {
        let target = request.content.as_deref().map(Key::parse);
        let response = match target {
            Some(Ok(key)) => {
                let released = self.release(key, now);
                tracing::info!(%key, released, "exchange cancelled by peer");
                Envelope::new(Action::CancelResponse, Some(key.to_string()), request.message_key)
            }
            _ => {
                tracing::warn!(request = %request.message_key, content = ?request.content, "cancel request names no valid key");
                Envelope::new(Action::CancelResponse, request.content.clone(), request.message_key)
                    .with_error(BAD_KEY)
            }
        };
        if let Err(e) = self.send_envelope(&response, None, now) {
            tracing::warn!(key = %request.message_key, error = %e, "failed to queue cancel response");
        }
    }

    /// Stop every local trace of `key`: the active send, queued sends, and
    /// any reassembly in progress. Returns whether anything was running.
    fn release(&mut self, key: Key, now: Instant) -> bool {
        let active = self.sends.discard_active(key);
        let queued = self.sends.remove_pending(key);
        let receiving = self.receives.cancel(key, now);
        active || queued > 0 || receiving
    }
}
