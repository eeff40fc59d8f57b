//! # parley-node
//!
//! Loopback driver for the call stack: two parties in one process, one
//! SQLite signaling file, real WebRTC peer connections between them.
//!
//! The callee answers whatever rings. The caller places a call, holds it for
//! `PARLEY_HOLD_SECS`, then hangs up.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_media::{DeviceCapabilities, MediaGateway, PeerFactory, SyntheticDevices, WebRtcConfig, WebRtcPeerFactory};
use parley_session::{spawn_session, SessionConfig, SessionContext, SessionHandle, SessionView, StepKind};
use parley_shared::PartyId;
use parley_store::{Database, SignalingChannel, SqliteChannel};

use crate::config::NodeConfig;

/// Slack on top of the unanswered timeout before the caller gives up
/// waiting for any outcome at all.
const OUTCOME_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_session=debug,parley_node=debug")),
        )
        .init();

    info!("Starting parley node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    let session_config = SessionConfig::from_env();
    info!(?config, ?session_config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the shared signaling store and the media engine
    // -----------------------------------------------------------------------
    let db_path = match &config.db_path {
        Some(path) => path.clone(),
        None => Database::default_path()?,
    };
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    info!(path = %db_path.display(), "Opening signaling store");
    let channel: Arc<dyn SignalingChannel> = Arc::new(SqliteChannel::open_at(&db_path)?);

    let peers: Arc<dyn PeerFactory> = Arc::new(WebRtcPeerFactory::new(WebRtcConfig {
        ice_servers: config.stun_url.iter().cloned().collect(),
    })?);

    // -----------------------------------------------------------------------
    // 4. Spawn both parties
    // -----------------------------------------------------------------------
    let party = |id: &PartyId, camera: bool| {
        let devices = SyntheticDevices::new(DeviceCapabilities {
            has_camera: camera,
            has_microphone: true,
        });
        spawn_session(SessionContext {
            conversation: config.conversation.clone(),
            local: id.clone(),
            channel: channel.clone(),
            media: MediaGateway::new(Arc::new(devices)),
            peers: peers.clone(),
            config: session_config.clone(),
        })
    };
    let caller = party(&config.caller, config.caller_camera);
    let callee = party(&config.callee, config.callee_camera);

    let answering = tokio::spawn(auto_answer(callee.clone()));

    // -----------------------------------------------------------------------
    // 5. Run the call (until done or Ctrl+C)
    // -----------------------------------------------------------------------
    let outcome_timeout = session_config.unanswered_timeout + OUTCOME_GRACE;
    let result = tokio::select! {
        result = place_call(&caller, &callee, config.hold, outcome_timeout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    answering.abort();
    caller.close().await;
    callee.close().await;

    result
}

/// Answer every incoming call until the session closes.
async fn auto_answer(session: SessionHandle) {
    let mut views = session.subscribe();
    loop {
        let ringing = views.borrow_and_update().step == StepKind::Incoming;
        if ringing {
            info!("Callee answering");
            session.accept().await;
        }
        if views.changed().await.is_err() || session.view().closed {
            break;
        }
    }
}

async fn place_call(
    caller: &SessionHandle,
    callee: &SessionHandle,
    hold: Duration,
    outcome_timeout: Duration,
) -> anyhow::Result<()> {
    let ready = Duration::from_secs(10);
    wait_until(caller, ready, |v| v.step == StepKind::Previewing)
        .await
        .context("caller never reached preview")?;
    wait_until(callee, ready, |v| v.step == StepKind::Previewing)
        .await
        .context("callee never reached preview")?;

    caller.start().await;
    let view = wait_until(caller, ready, |v| v.step != StepKind::Previewing || v.error.is_some())
        .await
        .context("caller never started dialing")?;
    if view.step != StepKind::Calling {
        bail!("call could not be placed: {}", view.error.unwrap_or_default());
    }
    info!(call = ?view.call_id, "Ringing");

    let view = wait_until(caller, outcome_timeout, |v| v.step != StepKind::Calling)
        .await
        .context("no outcome for the call")?;
    if view.step != StepKind::InCall {
        warn!(
            status = view.status_message.as_deref().unwrap_or("-"),
            error = view.error.as_deref().unwrap_or("-"),
            "Call did not connect"
        );
        return Ok(());
    }

    info!(hold_secs = hold.as_secs(), "Call connected, holding");
    tokio::time::sleep(hold).await;

    caller.end().await;
    let view = wait_until(callee, ready, |v| v.step == StepKind::Previewing)
        .await
        .context("callee never saw the hang-up")?;
    info!(status = view.status_message.as_deref().unwrap_or("-"), "Call finished");
    Ok(())
}

async fn wait_until(
    session: &SessionHandle,
    within: Duration,
    pred: impl FnMut(&SessionView) -> bool,
) -> anyhow::Result<SessionView> {
    let mut views = session.subscribe();
    let view = tokio::time::timeout(within, views.wait_for(pred))
        .await
        .context("timed out")?
        .context("session stopped")?;
    Ok(view.clone())
}
