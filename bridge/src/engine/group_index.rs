use dashmap::DashMap;
use tracing::info;

use crate::config::BridgeConfig;

/// One room's membership in a bridged group. Carries the server identity
/// only; the live connection is resolved through the connection table, so
/// no ownership cycle exists between groups and connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMembership {
    pub server: String,
    pub room: String,
    pub media_inbound: bool,
    pub media_outbound: bool,
}

/// Shared index of bridged groups. Read by every sync worker while the
/// membership tracker removes entries from other workers, hence the
/// concurrent maps.
pub struct GroupIndex {
    /// Group name -> member rooms. A group may hold any number of rooms on
    /// the same server.
    groups: DashMap<String, Vec<RoomMembership>>,
    /// Reverse lookup: (server, room) -> group name.
    room_to_group: DashMap<(String, String), String>,
}

impl GroupIndex {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            room_to_group: DashMap::new(),
        }
    }

    /// Populate the index from the static configuration at startup. The
    /// config is already validated; well-formed input is never rejected.
    pub fn build(config: &BridgeConfig) -> Self {
        let index = Self::new();
        for server in &config.servers {
            for room in &server.rooms {
                index.insert(
                    &room.name,
                    RoomMembership {
                        server: server.homeserver.clone(),
                        room: room.room.clone(),
                        media_inbound: room.media_inbound,
                        media_outbound: room.media_outbound,
                    },
                );
            }
        }
        info!(
            groups = index.groups.len(),
            rooms = index.room_to_group.len(),
            "group index built"
        );
        index
    }

    pub fn insert(&self, group: &str, membership: RoomMembership) {
        self.room_to_group.insert(
            (membership.server.clone(), membership.room.clone()),
            group.to_string(),
        );
        self.groups
            .entry(group.to_string())
            .or_default()
            .push(membership);
    }

    /// The group a room belongs to, if any.
    pub fn group_of(&self, server: &str, room: &str) -> Option<String> {
        self.room_to_group
            .get(&(server.to_string(), room.to_string()))
            .map(|entry| entry.clone())
    }

    /// The full membership record for a room, if tracked.
    pub fn membership_of(&self, server: &str, room: &str) -> Option<RoomMembership> {
        let group = self.group_of(server, room)?;
        self.groups.get(&group)?.iter().find_map(|m| {
            (m.server == server && m.room == room).then(|| m.clone())
        })
    }

    /// All members of a group except the excluded (server, room): the
    /// fan-out targets for an event originating there.
    pub fn members_of(&self, group: &str, excluding: (&str, &str)) -> Vec<RoomMembership> {
        let Some(members) = self.groups.get(group) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|m| !(m.server == excluding.0 && m.room == excluding.1))
            .cloned()
            .collect()
    }

    /// Drop a room from its group. Empty groups are removed entirely.
    pub fn remove(&self, server: &str, room: &str) {
        let Some((_, group)) = self
            .room_to_group
            .remove(&(server.to_string(), room.to_string()))
        else {
            return;
        };

        // Release the get_mut guard before removing the group entry to avoid
        // a DashMap deadlock on the same shard.
        let now_empty = match self.groups.get_mut(&group) {
            Some(mut members) => {
                members.retain(|m| !(m.server == server && m.room == room));
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove(&group);
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl Default for GroupIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(server: &str, room: &str) -> RoomMembership {
        RoomMembership {
            server: server.into(),
            room: room.into(),
            media_inbound: true,
            media_outbound: true,
        }
    }

    fn sample_index() -> GroupIndex {
        let index = GroupIndex::new();
        index.insert("general", member("server-x", "!a:x"));
        index.insert("general", member("server-y", "!b:y"));
        index.insert("general", member("server-y", "!c:y"));
        index.insert("dev", member("server-x", "!d:x"));
        index
    }

    #[test]
    fn group_of_resolves_tracked_rooms() {
        let index = sample_index();
        assert_eq!(index.group_of("server-x", "!a:x").as_deref(), Some("general"));
        assert_eq!(index.group_of("server-x", "!d:x").as_deref(), Some("dev"));
        assert_eq!(index.group_of("server-x", "!nope:x"), None);
        // Same room id on a different server is a different membership.
        assert_eq!(index.group_of("server-z", "!a:x"), None);
    }

    #[test]
    fn members_of_excludes_the_source_room() {
        let index = sample_index();
        let members = index.members_of("general", ("server-x", "!a:x"));
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.server == "server-y"));

        assert!(index.members_of("missing", ("server-x", "!a:x")).is_empty());
    }

    #[test]
    fn a_group_may_hold_many_rooms_on_one_server() {
        let index = sample_index();
        let on_y = index
            .members_of("general", ("server-x", "!a:x"))
            .into_iter()
            .filter(|m| m.server == "server-y")
            .count();
        assert_eq!(on_y, 2);
    }

    #[test]
    fn remove_drops_the_membership() {
        let index = sample_index();
        index.remove("server-y", "!b:y");

        assert_eq!(index.group_of("server-y", "!b:y"), None);
        let members = index.members_of("general", ("server-x", "!a:x"));
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].room, "!c:y");
    }

    #[test]
    fn removing_the_last_member_drops_the_group() {
        let index = sample_index();
        assert_eq!(index.group_count(), 2);
        index.remove("server-x", "!d:x");
        assert_eq!(index.group_count(), 1);
        assert!(index.members_of("dev", ("", "")).is_empty());
    }

    #[test]
    fn remove_of_untracked_room_is_a_no_op() {
        let index = sample_index();
        index.remove("server-x", "!nope:x");
        assert_eq!(index.group_count(), 2);
    }

    #[test]
    fn membership_of_returns_flags() {
        let index = GroupIndex::new();
        index.insert(
            "general",
            RoomMembership {
                server: "server-x".into(),
                room: "!a:x".into(),
                media_inbound: false,
                media_outbound: true,
            },
        );
        let m = index.membership_of("server-x", "!a:x").unwrap();
        assert!(!m.media_inbound);
        assert!(m.media_outbound);
    }
}
