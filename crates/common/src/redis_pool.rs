//! Redis connection for the shared quota budget.

use redis::Client;
use redis::aio::ConnectionManager;

/// Connect and round-trip a `PING`, so a bad `REDIS_URL` fails at start-up
/// instead of on the first quota check.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis, quota budget is shared");
    Ok(manager)
}
