use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::client::ChatClient;
use crate::client::events::MessageContent;

use super::group_index::RoomMembership;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Content references re-uploaded to one destination server, cached for the
/// duration of a single event's fan-out so each server receives at most one
/// upload of the main content and one of the thumbnail. Each reference is
/// memoized as soon as its own upload succeeds, so a failed thumbnail
/// upload never causes the main content to be uploaded again.
#[derive(Default)]
struct UploadMemo {
    url: Option<String>,
    thumbnail_url: Option<String>,
}

/// Downloads an event's media once from the source server and hands back a
/// rewritten copy of the content for each destination, re-uploading per
/// destination server as needed.
pub struct MediaRelay<C: ChatClient> {
    connections: Arc<HashMap<String, Arc<C>>>,
}

impl<C: ChatClient> MediaRelay<C> {
    pub fn new(connections: Arc<HashMap<String, Arc<C>>>) -> Self {
        Self { connections }
    }

    /// Relay one media event to `destinations` (already filtered to rooms
    /// that accept inbound media). Returns the destinations that can be
    /// sent to, each paired with its rewritten content.
    ///
    /// Download failures abort the whole event: if a thumbnail is declared
    /// it must come along, never the main content without it. Upload
    /// failures only skip the affected destination. Destinations are
    /// processed sequentially; fan-out latency grows with their count.
    pub async fn relay(
        &self,
        source: &Arc<C>,
        content: &MessageContent,
        destinations: &[RoomMembership],
    ) -> Vec<(RoomMembership, MessageContent)> {
        let Some(source_url) = content.url.as_deref() else {
            warn!(
                server = %source.homeserver(),
                body = %content.body,
                "media event carries no content URI, dropping"
            );
            return Vec::new();
        };

        let main_bytes = match source.download(source_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    server = %source.homeserver(),
                    body = %content.body,
                    error = %e,
                    "failed to download media, dropping event"
                );
                return Vec::new();
            }
        };

        let thumbnail_url = content
            .info
            .as_ref()
            .and_then(|info| info.thumbnail_url.clone());
        let thumb_bytes = match &thumbnail_url {
            Some(url) => match source.download(url).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(
                        server = %source.homeserver(),
                        body = %content.body,
                        error = %e,
                        "failed to download thumbnail, dropping event"
                    );
                    return Vec::new();
                }
            },
            None => None,
        };

        let mime = content
            .info
            .as_ref()
            .and_then(|info| info.mime_type.clone())
            .unwrap_or_else(|| FALLBACK_MIME.to_string());
        let thumb_mime = content
            .info
            .as_ref()
            .and_then(|info| info.thumbnail_info.as_ref())
            .and_then(|t| t.mime_type.clone())
            .unwrap_or_else(|| FALLBACK_MIME.to_string());

        let mut memo: HashMap<String, UploadMemo> = HashMap::new();
        let mut out = Vec::with_capacity(destinations.len());

        for member in destinations {
            // Same server as the source: the original URI stays valid.
            if member.server == source.homeserver() {
                out.push((member.clone(), content.clone()));
                continue;
            }

            let Some(dest) = self.connections.get(&member.server) else {
                warn!(server = %member.server, "no live connection for destination server");
                continue;
            };

            let uploaded = memo.entry(member.server.clone()).or_default();

            if uploaded.url.is_none() {
                match dest.upload(main_bytes.clone(), &mime).await {
                    Ok(url) => uploaded.url = Some(url),
                    Err(e) => {
                        warn!(
                            server = %member.server,
                            body = %content.body,
                            error = %e,
                            "failed to upload media, skipping destination"
                        );
                        continue;
                    }
                }
            }
            if let Some(bytes) = &thumb_bytes
                && uploaded.thumbnail_url.is_none()
            {
                match dest.upload(bytes.clone(), &thumb_mime).await {
                    Ok(url) => uploaded.thumbnail_url = Some(url),
                    Err(e) => {
                        warn!(
                            server = %member.server,
                            body = %content.body,
                            error = %e,
                            "failed to upload thumbnail, skipping destination"
                        );
                        continue;
                    }
                }
            }

            let mut outgoing = content.clone();
            outgoing.url = uploaded.url.clone();
            if let Some(thumb) = &uploaded.thumbnail_url
                && let Some(info) = outgoing.info.as_mut()
            {
                info.thumbnail_url = Some(thumb.clone());
            }
            out.push((member.clone(), outgoing));
        }

        out
    }
}
