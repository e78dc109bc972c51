// Core identifiers shared across all mapsync crates.

use uuid::Uuid;

/// Identifies a collaboratively edited map.
pub type DocumentId = Uuid;

/// Identifies one client connection to a session. Random per connection.
pub type ClientId = Uuid;

/// Ephemeral per-client presence (cursor, selection, display name).
///
/// The server stores and forwards it without interpreting it.
pub type Awareness = serde_json::Value;
