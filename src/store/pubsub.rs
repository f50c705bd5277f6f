//! Update-bus listener
//!
//! One task per process holds a dedicated pub/sub connection: SUBSCRIBE on
//! the update notice channel and PSUBSCRIBE on the `ws:*` push family. Every
//! received message is dispatched to the local push gateway by session id;
//! messages for sessions with no local observers are dropped there. The
//! connection is re-established with a short back-off on transport loss —
//! observers missing notices during the gap recover via resync.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::UpdateNotice;
use crate::config::Config;
use crate::ws::PushGateway;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Spawn the bus listener. Runs until the shutdown flag flips.
pub fn spawn_update_listener(
    client: redis::Client,
    config: Arc<Config>,
    gateway: Arc<PushGateway>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match listen_once(&client, &config, &gateway, &mut shutdown).await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    tracing::warn!(error = %e, "update bus connection lost, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::info!("update bus listener stopped");
    })
}

async fn listen_once(
    client: &redis::Client,
    config: &Config,
    gateway: &PushGateway,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), redis::RedisError> {
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(config.updates_channel()).await?;
    pubsub.psubscribe(config.push_pattern()).await?;
    tracing::info!(
        channel = %config.updates_channel(),
        pattern = %config.push_pattern(),
        "update bus listener attached"
    );

    let updates_channel = config.updates_channel();
    let push_prefix = format!("{}ws:", config.key_prefix);
    let mut stream = pubsub.on_message();

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pub/sub stream ended",
                    )));
                };
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "undecodable bus payload");
                        continue;
                    }
                };
                dispatch(gateway, &updates_channel, &push_prefix, &channel, payload);
            }
        }
    }
}

fn dispatch(
    gateway: &PushGateway,
    updates_channel: &str,
    push_prefix: &str,
    channel: &str,
    payload: String,
) {
    if channel == updates_channel {
        match serde_json::from_str::<UpdateNotice>(&payload) {
            Ok(notice) => gateway.dispatch_update(notice.session_id, notice.state),
            Err(e) => {
                tracing::warn!(error = %e, "malformed update notice dropped");
            }
        }
        return;
    }

    if let Some(raw_id) = channel.strip_prefix(push_prefix) {
        match raw_id.parse::<Uuid>() {
            Ok(session_id) => gateway.dispatch_raw(session_id, payload),
            Err(_) => {
                tracing::warn!(channel = %channel, "push channel with malformed session id");
            }
        }
    }
}
