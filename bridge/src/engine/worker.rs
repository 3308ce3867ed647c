use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::ChatClient;
use crate::client::events::SyncEvent;

use super::membership::MembershipTracker;
use super::router::EventRouter;

/// Pause after a failed sync so a broken homeserver doesn't spin the loop.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Event-pull loop for one server connection. Each connection runs exactly
/// one of these; events are dispatched sequentially in arrival order, so a
/// slow relay blocks this server's stream but no other server's.
///
/// The backlog delivered by the very first sync is discarded; only events
/// arriving while the bridge is running are relayed.
pub async fn run_sync_loop<C: ChatClient>(
    server: Arc<C>,
    tracker: Arc<MembershipTracker>,
    router: Arc<EventRouter<C>>,
    cancel: CancellationToken,
) {
    let mut since: Option<String> = None;

    while !cancel.is_cancelled() {
        let batch = match server.sync_once(since.as_deref()).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(server = %server.homeserver(), error = %e, "sync failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SYNC_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        let is_initial = since.is_none();
        since = Some(batch.next_batch);
        if is_initial {
            continue;
        }

        for event in batch.events {
            match event {
                SyncEvent::Membership(change) => {
                    tracker.on_membership_change(server.as_ref(), &change);
                }
                SyncEvent::Message(message) => {
                    router.on_message(&server, &message).await;
                }
            }
        }
    }

    info!(server = %server.homeserver(), "sync loop stopped");
}
