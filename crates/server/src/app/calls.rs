use crate::util::generate_id;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Active,
}

/// One voice-call attempt between two users. Terminal outcomes (ended,
/// rejected, unavailable) discard the session; nothing is retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.caller == user_id || self.callee == user_id
    }

    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.caller == user_id {
            Some(self.callee.as_str())
        } else if self.callee == user_id {
            Some(self.caller.as_str())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiateRejection {
    AlreadyInCall,
    CalleeUnavailable,
    CalleeBusy,
}

#[derive(Default)]
struct CallTable {
    sessions: HashMap<String, CallSession>,
    // user id -> call id; both parties are indexed from ringing onwards,
    // which is what makes the busy invariant atomic with session creation.
    busy: HashMap<String, String>,
}

impl CallTable {
    fn session_between<'a>(&'a self, user_id: &str, peer_id: &str) -> Option<&'a CallSession> {
        let call_id = self.busy.get(user_id)?;
        let session = self.sessions.get(call_id)?;
        if session.is_party(user_id) && session.is_party(peer_id) && user_id != peer_id {
            Some(session)
        } else {
            None
        }
    }

    fn discard(&mut self, call_id: &str) -> Option<CallSession> {
        let session = self.sessions.remove(call_id)?;
        self.busy.remove(&session.caller);
        self.busy.remove(&session.callee);
        Some(session)
    }
}

/// Per-pair call lifecycle state machine. All mutations serialize through
/// one lock, so of two simultaneous initiates between the same pair the
/// first to commit wins and the second observes a busy party.
pub struct CallRegistry {
    table: Mutex<CallTable>,
}

impl CallRegistry {
    pub fn new() -> Self {
        CallRegistry {
            table: Mutex::new(CallTable::default()),
        }
    }

    /// idle -> ringing. Checks run in contract order: caller busy, callee
    /// reachable, callee busy. On success both parties are marked busy
    /// and the session is stored as ringing.
    pub async fn initiate(
        &self,
        caller: &str,
        callee: &str,
        callee_present: bool,
    ) -> Result<CallSession, InitiateRejection> {
        let mut table = self.table.lock().await;
        if caller == callee {
            return Err(InitiateRejection::CalleeBusy);
        }
        if table.busy.contains_key(caller) {
            return Err(InitiateRejection::AlreadyInCall);
        }
        if !callee_present {
            return Err(InitiateRejection::CalleeUnavailable);
        }
        if table.busy.contains_key(callee) {
            return Err(InitiateRejection::CalleeBusy);
        }
        let session = CallSession {
            call_id: generate_id(&format!("call:{}:{}", caller, callee)),
            caller: caller.to_string(),
            callee: callee.to_string(),
            state: CallState::Ringing,
            created_at: Utc::now(),
        };
        table.busy.insert(caller.to_string(), session.call_id.clone());
        table.busy.insert(callee.to_string(), session.call_id.clone());
        table
            .sessions
            .insert(session.call_id.clone(), session.clone());
        Ok(session)
    }

    /// ringing -> active. Valid only when a ringing session exists in
    /// which `callee` is the called party and `caller` the initiator;
    /// anything else is a stale or forged answer and yields `None`.
    pub async fn answer(&self, callee: &str, caller: &str) -> Option<CallSession> {
        let mut table = self.table.lock().await;
        let call_id = {
            let session = table.session_between(callee, caller)?;
            if session.state != CallState::Ringing || session.callee != callee {
                return None;
            }
            session.call_id.clone()
        };
        let session = table.sessions.get_mut(&call_id)?;
        session.state = CallState::Active;
        Some(session.clone())
    }

    /// ringing -> rejected. Either party may reject while ringing; the
    /// session is discarded and both busy flags clear.
    pub async fn reject(&self, by: &str, peer: &str) -> Option<CallSession> {
        let mut table = self.table.lock().await;
        let call_id = {
            let session = table.session_between(by, peer)?;
            if session.state != CallState::Ringing {
                return None;
            }
            session.call_id.clone()
        };
        table.discard(&call_id)
    }

    /// ringing|active -> ended. Idempotent: terminating a session that was
    /// already discarded (double hang-up race) is a no-op, not an error.
    pub async fn terminate(&self, by: &str, peer: &str) -> Option<CallSession> {
        let mut table = self.table.lock().await;
        let call_id = table.session_between(by, peer)?.call_id.clone();
        table.discard(&call_id)
    }

    /// Whether a candidate from `from` may be relayed to `to`. Late
    /// candidates for a discarded session answer `false` and are dropped
    /// by the caller without an error.
    pub async fn relay_candidate(&self, from: &str, to: &str) -> bool {
        let table = self.table.lock().await;
        table.session_between(from, to).is_some()
    }

    /// Clears every session the user is a party to (at most one, by the
    /// busy invariant) and returns them so the counterparties can be
    /// notified. Invoked on disconnect and on connection replacement.
    pub async fn drop_party(&self, user_id: &str) -> Vec<CallSession> {
        let mut table = self.table.lock().await;
        let affected: Vec<String> = table
            .sessions
            .values()
            .filter(|session| session.is_party(user_id))
            .map(|session| session.call_id.clone())
            .collect();
        affected
            .iter()
            .filter_map(|call_id| table.discard(call_id))
            .collect()
    }

    #[cfg(test)]
    pub async fn is_busy(&self, user_id: &str) -> bool {
        let table = self.table.lock().await;
        table.busy.contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initiate_marks_both_parties_busy() {
        let registry = CallRegistry::new();
        let session = registry.initiate("a", "b", true).await.expect("ringing");
        assert_eq!(session.state, CallState::Ringing);
        assert!(registry.is_busy("a").await);
        assert!(registry.is_busy("b").await);
    }

    #[tokio::test]
    async fn busy_caller_cannot_initiate_again() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        assert_eq!(
            registry.initiate("a", "c", true).await,
            Err(InitiateRejection::AlreadyInCall)
        );
    }

    #[tokio::test]
    async fn busy_callee_rejects_second_caller() {
        let registry = CallRegistry::new();
        registry.initiate("b", "c", true).await.expect("ringing");
        registry.answer("c", "b").await.expect("active");
        // a calls b while b is active with c; b/c's session is untouched.
        assert_eq!(
            registry.initiate("a", "b", true).await,
            Err(InitiateRejection::CalleeBusy)
        );
        assert!(registry.is_busy("c").await);
        assert!(registry.relay_candidate("b", "c").await);
    }

    #[tokio::test]
    async fn self_call_is_rejected() {
        let registry = CallRegistry::new();
        assert_eq!(
            registry.initiate("a", "a", true).await,
            Err(InitiateRejection::CalleeBusy)
        );
        assert!(!registry.is_busy("a").await);
    }

    #[tokio::test]
    async fn offline_callee_is_unavailable() {
        let registry = CallRegistry::new();
        assert_eq!(
            registry.initiate("a", "b", false).await,
            Err(InitiateRejection::CalleeUnavailable)
        );
        assert!(!registry.is_busy("a").await);
    }

    #[tokio::test]
    async fn simultaneous_initiate_first_committed_wins() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        assert_eq!(
            registry.initiate("b", "a", true).await,
            Err(InitiateRejection::AlreadyInCall)
        );
    }

    #[tokio::test]
    async fn answer_requires_ringing_and_matching_callee() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        // The initiator cannot answer their own call.
        assert!(registry.answer("a", "b").await.is_none());
        let session = registry.answer("b", "a").await.expect("active");
        assert_eq!(session.state, CallState::Active);
        // A second answer hits a non-ringing session.
        assert!(registry.answer("b", "a").await.is_none());
    }

    #[tokio::test]
    async fn reject_only_while_ringing() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        registry.answer("b", "a").await.expect("active");
        assert!(registry.reject("b", "a").await.is_none());
        // terminate still applies to the active session
        assert!(registry.terminate("b", "a").await.is_some());
    }

    #[tokio::test]
    async fn reject_clears_busy_for_both() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        let session = registry.reject("b", "a").await.expect("rejected");
        assert_eq!(session.caller, "a");
        assert!(!registry.is_busy("a").await);
        assert!(!registry.is_busy("b").await);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        assert!(registry.terminate("a", "b").await.is_some());
        assert!(registry.terminate("a", "b").await.is_none());
        assert!(registry.terminate("b", "a").await.is_none());
    }

    #[tokio::test]
    async fn terminate_ignores_non_parties() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        // c is busy with nobody; nothing to terminate against a.
        assert!(registry.terminate("c", "a").await.is_none());
        assert!(registry.is_busy("a").await);
    }

    #[tokio::test]
    async fn late_candidates_after_teardown_are_dropped() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        assert!(registry.relay_candidate("a", "b").await);
        assert!(registry.relay_candidate("b", "a").await);
        assert!(!registry.relay_candidate("a", "c").await);
        registry.terminate("a", "b").await.expect("ended");
        assert!(!registry.relay_candidate("b", "a").await);
    }

    #[tokio::test]
    async fn drop_party_clears_active_session() {
        let registry = CallRegistry::new();
        registry.initiate("a", "b", true).await.expect("ringing");
        registry.answer("b", "a").await.expect("active");
        let dropped = registry.drop_party("a").await;
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].peer_of("a"), Some("b"));
        assert!(!registry.is_busy("a").await);
        assert!(!registry.is_busy("b").await);
        // A second drop finds nothing: exactly one notification fires.
        assert!(registry.drop_party("a").await.is_empty());
    }

    #[tokio::test]
    async fn full_signaling_round_leaves_no_residue() {
        let registry = CallRegistry::new();
        let ringing = registry.initiate("a", "b", true).await.expect("ringing");
        assert_eq!(ringing.callee, "b");
        registry.answer("b", "a").await.expect("active");
        assert!(registry.relay_candidate("a", "b").await);
        registry.terminate("a", "b").await.expect("ended");
        // Cleanup proven: either side can immediately call again.
        registry.initiate("b", "a", true).await.expect("ringing");
    }
}
