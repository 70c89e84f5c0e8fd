//! # murmur-node
//!
//! Loopback node for Murmur.
//!
//! Two local users share one in-process signaling store. The node:
//! - checks the end-to-end message path (key publication, dual wrap,
//!   recipient and sender reads)
//! - places a real WebRTC call between the two users with synthetic
//!   capture devices, logs the negotiated quality and a few stats samples,
//!   then hangs up

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use murmur_call::{CallConfig, CallDeps, CallEvent, CallHandle, CallManager};
use murmur_media::{SyntheticDevices, WebRtcConnector};
use murmur_shared::UserId;
use murmur_store::{Database, DocumentContent, KeyRegistry, MemoryStore, MessageCrypto};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CALL_WAIT: Duration = Duration::from_secs(20);
const STATS_SAMPLES: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,murmur_call=debug,murmur_media=debug,webrtc=warn")
        }))
        .init();

    info!("Starting Murmur node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = CallConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Shared signaling store and the two local users
    // -----------------------------------------------------------------------
    let store = Arc::new(MemoryStore::new());
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    check_messages(&store, &alice, &bob)
        .await
        .context("end-to-end message check failed")?;

    // -----------------------------------------------------------------------
    // 4. Loopback call
    // -----------------------------------------------------------------------
    run_call(&store, &config, alice, bob).await
}

async fn check_messages(store: &Arc<MemoryStore>, alice: &UserId, bob: &UserId) -> anyhow::Result<()> {
    let db = Database::open_in_memory()?;
    let alice_crypto = MessageCrypto::new(Arc::new(KeyRegistry::new(
        db.ensure_keypair(alice)?,
        store.clone(),
    )));
    let bob_crypto = MessageCrypto::new(Arc::new(KeyRegistry::new(
        db.ensure_keypair(bob)?,
        store.clone(),
    )));
    alice_crypto.registry().publish().await?;
    bob_crypto.registry().publish().await?;

    let doc = alice_crypto.encrypt_text(bob, "Hello").await?;
    match bob_crypto.read_document(alice, &doc) {
        DocumentContent::Decrypted(text) => info!(%text, "recipient read the message"),
        other => anyhow::bail!("recipient could not read the message: {other:?}"),
    }
    match alice_crypto.read_document(alice, &doc) {
        DocumentContent::Decrypted(_) => info!("sender read its own copy"),
        other => anyhow::bail!("sender could not read its own copy: {other:?}"),
    }
    Ok(())
}

async fn spawn_user(
    store: &Arc<MemoryStore>,
    config: &CallConfig,
    uid: UserId,
) -> anyhow::Result<(CallHandle, mpsc::Receiver<CallEvent>)> {
    let connector = WebRtcConnector::new(config.ice.clone()).context("building WebRTC stack")?;
    let devices = SyntheticDevices::new().with_frame_generator();
    let spawned = CallManager::spawn(CallDeps {
        uid,
        store: store.clone(),
        devices: Arc::new(devices),
        connector: Arc::new(connector),
        config: config.clone(),
    })
    .await?;
    Ok(spawned)
}

async fn run_call(
    store: &Arc<MemoryStore>,
    config: &CallConfig,
    alice: UserId,
    bob: UserId,
) -> anyhow::Result<()> {
    let (alice_handle, mut alice_events) = spawn_user(store, config, alice).await?;
    let (bob_handle, mut bob_events) = spawn_user(store, config, bob.clone()).await?;

    // bob picks up as soon as it rings and stays until the call ends
    let callee = tokio::spawn(async move {
        while let Some(event) = bob_events.recv().await {
            match event {
                CallEvent::IncomingCall { call_id, from, .. } => {
                    info!(%call_id, from = %from.short(), "bob answers");
                    if let Err(e) = bob_handle.answer(&call_id).await {
                        warn!(error = %e, "bob could not answer");
                    }
                }
                CallEvent::Ended { reason, .. } => {
                    info!(?reason, "bob's side ended");
                    break;
                }
                other => debug!(event = ?other, "bob"),
            }
        }
    });

    let call_id = alice_handle.call(&bob, true).await?;
    info!(%call_id, "alice is calling bob");

    let watch = async {
        let mut samples = 0;
        while let Some(event) = alice_events.recv().await {
            match event {
                CallEvent::QualityApplied { path, profile } => info!(
                    ?path,
                    video_kbps = profile.video.max_bitrate_kbps,
                    audio_kbps = profile.audio.max_bitrate_kbps,
                    "media transport up"
                ),
                CallEvent::Stats(stats) => {
                    info!(
                        rtt_ms = ?stats.rtt_ms,
                        loss_pct = stats.packet_loss_pct,
                        inbound_kbps = stats.inbound_kbps,
                        outbound_kbps = stats.outbound_kbps,
                        "call stats"
                    );
                    samples += 1;
                    if samples >= STATS_SAMPLES {
                        return true;
                    }
                }
                CallEvent::Ended { reason, .. } => {
                    warn!(?reason, "call ended early");
                    return false;
                }
                other => debug!(event = ?other, "alice"),
            }
        }
        false
    };

    match tokio::time::timeout(CALL_WAIT, watch).await {
        Ok(true) => info!("loopback call healthy"),
        Ok(false) => warn!("loopback call did not complete"),
        Err(_) => warn!(wait = ?CALL_WAIT, "no media stats in time"),
    }

    alice_handle.end().await?;
    if tokio::time::timeout(Duration::from_secs(5), callee).await.is_err() {
        warn!("callee did not observe the hangup");
    }
    info!(state = ?alice_handle.state().await?, "Murmur node finished");
    Ok(())
}
