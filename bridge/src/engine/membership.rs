use std::sync::Arc;

use tracing::info;

use crate::client::ChatClient;
use crate::client::events::MembershipChange;

use super::group_index::GroupIndex;

/// Watches membership changes for the bridge's own account and prunes the
/// group index when the bridge is kicked or banned from a room. There is no
/// rejoin: a removed room stays gone until the next restart.
pub struct MembershipTracker {
    index: Arc<GroupIndex>,
}

impl MembershipTracker {
    pub fn new(index: Arc<GroupIndex>) -> Self {
        Self { index }
    }

    /// Handle one membership change from a server's sync stream. Changes
    /// that don't target the bridge account, or that aren't a leave/ban,
    /// are ignored.
    pub fn on_membership_change<C: ChatClient>(&self, server: &C, change: &MembershipChange) {
        if change.state_key != server.identity() {
            return;
        }
        if !change.membership.is_leave_or_ban() {
            return;
        }

        self.index.remove(server.homeserver(), &change.room);
        info!(
            server = %server.homeserver(),
            room = %change.room,
            "left or banned, room dropped from its bridge group"
        );
    }
}
