//! Call client
//!
//! Headless client for a channel's peer-to-peer call session. It joins the
//! configured channel, keeps the session alive until a shutdown signal and
//! then leaves cleanly.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (JSON output when `CALL_LOG_JSON` is set)
//! 3. Open the document store (Redis when `REDIS_URL` is set, in-process otherwise)
//! 4. Build the peer and media backends and load volume preferences
//! 5. Spawn the `SessionController` and join `CALL_CHANNEL_ID`
//! 6. Wait for shutdown signal
//!
//! # Shutdown
//!
//! The controller gets a bounded window to leave the session. If it does not
//! finish in time the local roster entry is marked `left` with a blocking
//! write so that peers do not keep a ghost participant.

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use call_session::actors::{DesiredMedia, DesiredSession, SessionControllerHandle};
use call_session::config::{Config, DEFAULT_LOG_FILTER};
use call_session::context::CallContext;
use call_session::media::RtcMediaBackend;
use call_session::peer::RtcPeerFactory;
use call_session::prefs::PreferenceStore;
use call_session::store::{DocumentStore, MemoryStore, RedisDocumentStore};
use common::observability::{init_tracing, ObservabilityConfig};
use common::secret::ExposeSecret;
use tokio::signal;
use tracing::{error, info, warn};

/// Bound on the async leave during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis key prefix for all call documents.
const REDIS_KEY_PREFIX: &str = "huddle";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A config error still needs a subscriber to be logged through.
    let config = Config::from_env();
    let observability = config.as_ref().map_or_else(
        |_| ObservabilityConfig::new(DEFAULT_LOG_FILTER, false),
        Config::observability,
    );
    init_tracing(&observability)?;

    info!("Starting call client");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        user_id = %config.user_id,
        session_doc_id = %config.session_doc_id,
        max_participants = config.max_participants,
        supports_kick = config.supports_kick,
        negotiation_timeout_secs = config.negotiation_timeout.as_secs(),
        log_json = config.log_json,
        "Configuration loaded successfully"
    );

    let store: Arc<dyn DocumentStore> = match &config.redis_url {
        Some(url) => {
            info!("Connecting to Redis...");
            let store = RedisDocumentStore::new(url.expose_secret(), REDIS_KEY_PREFIX)
                .await
                .context("failed to connect to Redis")?;
            info!("Redis connection established");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, using in-process document store");
            Arc::new(MemoryStore::new())
        }
    };

    let peers = Arc::new(RtcPeerFactory::new().context("failed to build peer connection API")?);
    let media = Arc::new(RtcMediaBackend::new(config.media_devices.iter().copied()));

    let prefs = match &config.prefs_path {
        Some(path) => PreferenceStore::load(path.clone())
            .with_context(|| format!("failed to load preferences from {}", path.display()))?,
        None => PreferenceStore::new(),
    };

    let ctx = CallContext::from_config(&config, store, peers, media);
    let (controller, controller_task) = SessionControllerHandle::spawn(
        ctx,
        prefs,
        DesiredMedia {
            audio: config.start_audio,
            video: config.start_video,
        },
    );

    if let Some(channel_id) = config.channel_id.clone() {
        info!(channel_id = %channel_id, "Joining call session");
        let desired = DesiredSession::new(channel_id, config.display_name.clone());
        if let Err(e) = controller.set_desired_session(Some(desired)).await {
            // Stay up; the status carries the reason for the user.
            warn!(error = %e, "Failed to join call session");
        }
    }

    shutdown_signal().await;
    info!("Shutdown signal received, leaving call session");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, controller.shutdown()).await {
        Ok(Ok(())) => info!("Call session left cleanly"),
        Ok(Err(e)) => warn!(error = %e, "Leave during shutdown failed"),
        Err(_) => {
            warn!("Leave timed out, marking participant left synchronously");
            let teardown = controller.clone();
            match tokio::task::spawn_blocking(move || teardown.teardown_blocking()).await {
                Ok(Ok(marked)) => info!(marked, "Blocking teardown complete"),
                Ok(Err(e)) => error!(error = %e, "Blocking teardown failed"),
                Err(e) => error!(error = %e, "Blocking teardown task panicked"),
            }
            controller.cancel();
        }
    }

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, controller_task)
        .await
        .is_err()
    {
        warn!("Controller task did not stop in time");
    }

    info!("Call client shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the client
/// cannot leave its session on exit.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Without signal handlers the client never leaves its call on exit"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Without signal handlers the client never leaves its call on exit"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
