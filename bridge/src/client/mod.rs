pub mod events;
pub mod matrix;

use anyhow::Result;

use events::{MessageContent, SyncBatch};

/// Capability surface of one authenticated homeserver connection. The relay
/// engine only ever talks to this trait: the real implementation is
/// [`matrix::MatrixClient`], and the tests run against an in-memory fake.
#[allow(async_fn_in_trait)]
pub trait ChatClient: Send + Sync + 'static {
    /// Stable identifier of the homeserver this connection is bound to.
    /// Used as the key in the connection table and in log output.
    fn homeserver(&self) -> &str;

    /// Fully-qualified user id the bridge is logged in as on this server.
    fn identity(&self) -> &str;

    /// Pull the next batch of events. Blocks (long-polls) until events
    /// arrive or the server-side timeout elapses.
    async fn sync_once(&self, since: Option<&str>) -> Result<SyncBatch>;

    /// Send an `m.room.message` event. Returns the event id.
    async fn send_message(&self, room: &str, content: &MessageContent) -> Result<String>;

    /// Send a bare plain-text message. Returns the event id.
    async fn send_text(&self, room: &str, body: &str) -> Result<String>;

    /// Download media content by mxc URI.
    async fn download(&self, mxc: &str) -> Result<Vec<u8>>;

    /// Upload media content, returning the new mxc URI on this server.
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String>;

    /// Join a room by id. Used at startup only; failures are logged, never
    /// retried.
    async fn join_room(&self, room: &str) -> Result<()>;

    /// Ask the connection to end its pull loop after the current iteration.
    fn stop(&self);
}
