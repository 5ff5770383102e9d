//! HTTP surface of the monitoring engine.
//!
//! Endpoints:
//! - GET    /health
//! - GET    /api/guilds/{guild_id}/watches
//! - POST   /api/guilds/{guild_id}/watches
//! - DELETE /api/guilds/{guild_id}/watches/{channel_id}
//! - POST   /api/guilds/{guild_id}/watches/{channel_id}/check
//! - GET    /api/guilds/{guild_id}/notifications?limit=
//! - GET    /api/channels/lookup?handle=
//! - GET    /api/monitor/attempts?limit=

pub mod routes;
pub mod state;
