use raftline_common::{LogIndex, Server};
use std::sync::Arc;
use tokio::sync::Notify;

/// Leader-side replication cursor for one follower. Lives only while the
/// local node leads; a new leadership builds fresh cursors.
#[derive(Debug)]
pub struct Peer {
    pub server: Server,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    /// Replicated to but not yet a voting member (being added).
    pub learner: bool,
    /// Within the catch-up margin of the leader's log after a successful round.
    pub caught_up: bool,
    wake: Arc<Notify>,
}

impl Peer {
    pub fn new(server: Server, next_index: LogIndex, learner: bool) -> Self {
        Self {
            server,
            next_index,
            match_index: 0,
            learner,
            caught_up: false,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle the peer's replication task waits on.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Whether `wake` came from this cursor. A peer removed and added again
    /// gets a new cursor, which the old replication task must not drive.
    pub fn is_driven_by(&self, wake: &Arc<Notify>) -> bool {
        Arc::ptr_eq(&self.wake, wake)
    }

    pub fn record_success(&mut self, matched: LogIndex, leader_last: LogIndex, catchup_margin: u64) {
        self.match_index = self.match_index.max(matched);
        self.next_index = self.match_index + 1;
        self.caught_up = self.match_index + catchup_margin >= leader_last;
    }

    /// Backs off after a consistency-check failure. `hint` is the follower's
    /// last log index.
    pub fn record_rejection(&mut self, hint: LogIndex) {
        let backed_off = self.next_index.saturating_sub(1).min(hint + 1);
        self.next_index = backed_off.max(self.match_index + 1).max(1);
    }
}
