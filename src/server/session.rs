//! Per-connection session loop.
//!
//! One session serves one transport channel: it authenticates the credential,
//! waits (bounded) for the `SUBSCRIBE`, registers the channel with the
//! [`SceneHub`], and then pumps messages both ways until either side closes.
//! The session owns nothing the hub needs — on any exit path it unsubscribes,
//! so a vanished client is indistinguishable from a polite one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error_codes::ErrorCode;
use crate::protocol::{ClientMessage, SceneId, ServerMessage};
use crate::server::auth::{Principal, TokenVerifier};
use crate::server::hub::{HubError, SceneHub};
use crate::server::store::StoreError;
use crate::transport::Transport;

/// How long a freshly accepted channel may idle before sending `SUBSCRIBE`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve one client channel to completion.
///
/// `token` is the opaque credential the gateway extracted from the connection
/// request (e.g. a query parameter). The transport is closed before this
/// function returns, on every path.
pub async fn serve(
    mut transport: impl Transport,
    hub: Arc<SceneHub>,
    verifier: &dyn TokenVerifier,
    token: &str,
) {
    // Authenticate once, before anything else is accepted on the channel.
    let principal = match verifier.verify(token).await {
        Ok(principal) => principal,
        Err(e) => {
            debug!("rejecting channel: {e}");
            send_error(
                &mut transport,
                ErrorCode::AuthFailed,
                "credential rejected".into(),
            )
            .await;
            let _ = transport.close().await;
            return;
        }
    };

    // The channel must declare its scene promptly or be reclaimed.
    let scene_id = match await_subscribe(&mut transport).await {
        Some(scene_id) => scene_id,
        None => {
            let _ = transport.close().await;
            return;
        }
    };

    let broadcasts = match hub.subscribe(scene_id, &principal).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(%scene_id, "subscribe failed: {e}");
            let code = match e {
                HubError::Store(StoreError::NotFound(_)) => ErrorCode::SceneNotFound,
                _ => ErrorCode::PersistenceFailure,
            };
            send_error(&mut transport, code, format!("cannot open scene: {e}")).await;
            let _ = transport.close().await;
            return;
        }
    };

    pump(&mut transport, &hub, &principal, scene_id, broadcasts).await;

    hub.unsubscribe(scene_id, principal.client_id).await;
    let _ = transport.close().await;
    debug!(%scene_id, client_id = %principal.client_id, "session ended");
}

/// Wait for the initial `SUBSCRIBE`, rejecting anything else.
async fn await_subscribe(transport: &mut impl Transport) -> Option<SceneId> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.recv()).await;
    match first {
        Ok(Some(Ok(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { scene_id }) => Some(scene_id),
            Ok(other) => {
                warn!(
                    "expected SUBSCRIBE as first message, got {:?}",
                    std::mem::discriminant(&other)
                );
                send_error(
                    transport,
                    ErrorCode::InvalidOperation,
                    "channel must subscribe before anything else".into(),
                )
                .await;
                None
            }
            Err(e) => {
                warn!("unparseable first message: {e}");
                None
            }
        },
        Ok(Some(Err(e))) => {
            debug!("transport error during handshake: {e}");
            None
        }
        Ok(None) => None,
        Err(_) => {
            debug!("handshake timed out");
            None
        }
    }
}

/// Bidirectional message pump: inbound client messages are dispatched to the
/// hub, hub broadcasts are written out. Exits when either side closes.
async fn pump(
    transport: &mut impl Transport,
    hub: &Arc<SceneHub>,
    principal: &Principal,
    scene_id: SceneId,
    mut broadcasts: mpsc::UnboundedReceiver<ServerMessage>,
) {
    loop {
        tokio::select! {
            outbound = broadcasts.recv() => {
                let Some(msg) = outbound else {
                    // Hub dropped our sender (room torn down).
                    break;
                };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = transport.send(json).await {
                            debug!("transport send failed: {e}");
                            break;
                        }
                    }
                    Err(e) => warn!("failed to serialize broadcast: {e}"),
                }
            }

            inbound = transport.recv() => {
                match inbound {
                    Some(Ok(text)) => {
                        let msg = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("unparseable client message: {e}");
                                continue;
                            }
                        };
                        if dispatch(transport, hub, principal, scene_id, msg).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("transport receive failed: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Handle one inbound message. Returns `Break` when the session should end.
async fn dispatch(
    transport: &mut impl Transport,
    hub: &Arc<SceneHub>,
    principal: &Principal,
    scene_id: SceneId,
    msg: ClientMessage,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    match msg {
        // Latency probes are answered inline; they never touch the hub.
        ClientMessage::Ping { ts } => {
            if let Ok(json) = serde_json::to_string(&ServerMessage::Pong { ts }) {
                if transport.send(json).await.is_err() {
                    return ControlFlow::Break(());
                }
            }
        }
        ClientMessage::Camera { pose } => {
            hub.relay_camera(scene_id, principal.client_id, pose).await;
        }
        ClientMessage::ViewportSync { viewport } => {
            hub.relay_viewport(scene_id, principal.client_id, viewport)
                .await;
        }
        ClientMessage::Chat { message } => {
            hub.relay_chat(scene_id, principal.client_id, message).await;
        }
        ClientMessage::SceneOperation(batch) => {
            if batch.scene_id != scene_id {
                send_error(
                    transport,
                    ErrorCode::InvalidOperation,
                    "submission targets a scene this channel is not subscribed to".into(),
                )
                .await;
            } else if let Err(e) = hub.submit(principal.client_id, *batch).await {
                warn!("submission failed: {e}");
                send_error(
                    transport,
                    ErrorCode::InternalError,
                    "submission could not be processed".into(),
                )
                .await;
            }
        }
        ClientMessage::Unsubscribe {
            scene_id: requested,
        } => {
            if requested == scene_id {
                return ControlFlow::Break(());
            }
            debug!(%requested, "ignoring unsubscribe for a different scene");
        }
        // One scene per channel; a second subscribe is a protocol misuse.
        ClientMessage::Subscribe { .. } => {
            warn!("ignoring repeated SUBSCRIBE on an established channel");
        }
    }
    ControlFlow::Continue(())
}

/// Best-effort structured error write to the channel.
async fn send_error(transport: &mut impl Transport, code: ErrorCode, message: String) {
    let msg = ServerMessage::SceneError {
        code,
        message,
        details: None,
    };
    if let Ok(json) = serde_json::to_string(&msg) {
        let _ = transport.send(json).await;
    }
}
