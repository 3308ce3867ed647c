use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, trace, warn};

use crate::client::ChatClient;
use crate::client::events::{InboundEvent, MessageContent, MessageKind};

use super::group_index::GroupIndex;
use super::media::MediaRelay;

/// Routes inbound message events to the other rooms of their bridge group.
/// Stateless across events: the only shared state is the group index, plus
/// a media upload memo scoped to a single event inside [`MediaRelay`].
pub struct EventRouter<C: ChatClient> {
    index: Arc<GroupIndex>,
    connections: Arc<HashMap<String, Arc<C>>>,
    media: MediaRelay<C>,
}

impl<C: ChatClient> EventRouter<C> {
    pub fn new(index: Arc<GroupIndex>, connections: Arc<HashMap<String, Arc<C>>>) -> Self {
        Self {
            index,
            media: MediaRelay::new(connections.clone()),
            connections,
        }
    }

    /// Handle one message event from `source`'s sync stream. Runs the event
    /// to completion; per-destination failures are logged and skipped.
    pub async fn on_message(&self, source: &Arc<C>, event: &InboundEvent) {
        // Our own messages must never loop back. This also means the bridge
        // account can't double as a human account in a bridged room.
        if event.sender == source.identity() {
            return;
        }

        let Some(group) = self.index.group_of(source.homeserver(), &event.room) else {
            return;
        };

        let content = normalize(event.content.clone());

        match &content.kind {
            MessageKind::Text | MessageKind::Notice | MessageKind::Location => {
                self.relay_text(source, event, &group, content).await;
            }
            MessageKind::Emote
            | MessageKind::Image
            | MessageKind::Video
            | MessageKind::Audio
            | MessageKind::File => {
                self.relay_media(source, event, &group, content).await;
            }
            MessageKind::Unhandled(raw) => {
                info!(msgtype = %raw, "unhandled message type, dropping");
            }
        }
    }

    async fn relay_text(
        &self,
        source: &Arc<C>,
        event: &InboundEvent,
        group: &str,
        mut content: MessageContent,
    ) {
        content.body = format!("{} (from Bridge):\n{}", event.sender, content.body);
        if let Some(formatted) = content.formatted_body.take() {
            content.formatted_body = Some(format!(
                "{} (from Bridge):<br>{}",
                escape_html(&event.sender),
                formatted
            ));
        }

        for member in self
            .index
            .members_of(group, (source.homeserver(), &event.room))
        {
            let Some(dest) = self.connections.get(&member.server) else {
                warn!(server = %member.server, "no live connection for destination server");
                continue;
            };
            if let Err(e) = dest.send_message(&member.room, &content).await {
                warn!(
                    server = %member.server,
                    room = %member.room,
                    error = %e,
                    "failed to relay message"
                );
            }
        }
    }

    async fn relay_media(
        &self,
        source: &Arc<C>,
        event: &InboundEvent,
        group: &str,
        content: MessageContent,
    ) {
        let Some(membership) = self.index.membership_of(source.homeserver(), &event.room) else {
            return;
        };
        if !membership.media_outbound {
            trace!(
                server = %source.homeserver(),
                room = %event.room,
                "media outbound disabled for room, dropping"
            );
            return;
        }

        let destinations: Vec<_> = self
            .index
            .members_of(group, (source.homeserver(), &event.room))
            .into_iter()
            .filter(|m| m.media_inbound)
            .collect();
        if destinations.is_empty() {
            return;
        }

        // Every destination gets a plain-text line naming the sender ahead
        // of the media event, since formatted bodies aren't rewritten for
        // media. Same-server destinations get it too.
        let notice = format!("{} (from Bridge): {}", event.sender, content.body);

        for (member, outgoing) in self.media.relay(source, &content, &destinations).await {
            let Some(dest) = self.connections.get(&member.server) else {
                continue;
            };
            if let Err(e) = dest.send_text(&member.room, &notice).await {
                warn!(
                    server = %member.server,
                    room = %member.room,
                    error = %e,
                    "failed to send media notice"
                );
            }
            if let Err(e) = dest.send_message(&member.room, &outgoing).await {
                warn!(
                    server = %member.server,
                    room = %member.room,
                    error = %e,
                    "failed to relay media"
                );
            }
        }
    }
}

/// Strip relation state before relaying. The relation target doesn't exist
/// in destination rooms, so replies and edits fall back to their plain body.
fn normalize(mut content: MessageContent) -> MessageContent {
    if content.relates_to.is_some() {
        content.format = None;
        content.formatted_body = None;
    }
    content.new_content = None;
    content.relates_to = None;
    content
}

/// Escape HTML-significant characters for the formatted-body prefix.
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_covers_markup_characters() {
        assert_eq!(escape_html("@u:x"), "@u:x");
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn normalize_strips_relations_and_forces_fallback() {
        let raw = serde_json::json!({
            "msgtype": "m.text",
            "body": "fallback",
            "format": "org.matrix.custom.html",
            "formatted_body": "<b>fancy</b>",
            "m.relates_to": { "rel_type": "m.replace", "event_id": "$orig" },
            "m.new_content": { "msgtype": "m.text", "body": "fallback" }
        });
        let content: MessageContent = serde_json::from_value(raw).unwrap();

        let normalized = normalize(content);
        assert!(normalized.relates_to.is_none());
        assert!(normalized.new_content.is_none());
        assert!(normalized.format.is_none());
        assert!(normalized.formatted_body.is_none());
        assert_eq!(normalized.body, "fallback");
    }

    #[test]
    fn normalize_keeps_formatting_without_a_relation() {
        let raw = serde_json::json!({
            "msgtype": "m.text",
            "body": "plain",
            "format": "org.matrix.custom.html",
            "formatted_body": "<i>plain</i>"
        });
        let content: MessageContent = serde_json::from_value(raw).unwrap();

        let normalized = normalize(content);
        assert_eq!(normalized.formatted_body.as_deref(), Some("<i>plain</i>"));
    }
}
