mod aggregate;
mod config;
mod error;
mod hub;
mod riot;
mod schedule;
mod store;
mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{broadcast, watch, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::aggregate::Viewer;
use crate::config::{ServerEnv, Settings};
use crate::error::{AppError, Result};
use crate::hub::{Answer, GroupEvent, HubCommand, Registry};
use crate::store::Store;
use crate::types::*;

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    registry: Arc<Registry>,
    base_url: String,
}

/// Who is on the other end of a socket.
#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    offset_minutes: i32,
}

impl Session {
    fn viewer(&self) -> Viewer<'_> {
        Viewer {
            user_id: Some(self.user_id.as_str()),
            offset_minutes: self.offset_minutes,
        }
    }
}

fn parse_offset(params: &HashMap<String, String>) -> i32 {
    params
        .get("tzOffset")
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0)
        .clamp(-schedule::MAX_OFFSET_MINUTES, schedule::MAX_OFFSET_MINUTES)
}

// ─── HTTP routes ──────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "activeHubs": state.registry.active_hubs(),
    }))
}

async fn group_page(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<GroupView>> {
    let viewer = params
        .get("viewer")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::invalid("viewer is required"))?;

    let group = state.store.get_group(&group_id)?;
    if !group.is_member(viewer) {
        return Err(AppError::forbidden("Only group members can view this group"));
    }

    let view = state.store.group_view(
        &group_id,
        Viewer {
            user_id: Some(viewer.as_str()),
            offset_minutes: parse_offset(&params),
        },
        state.registry.now(),
    )?;
    Ok(Json(view))
}

async fn invite_page(State(state): State<AppState>, Path(token): Path<String>) -> Result<Json<InvitePreview>> {
    Ok(Json(state.store.invite_preview(&token, state.registry.now())?))
}

// ─── WebSocket ────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let user_id = params.get("userId").map(|s| s.trim().to_string()).unwrap_or_default();
    if user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "userId is required").into_response();
    }
    let session = Session {
        user_id,
        offset_minutes: parse_offset(&params),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, session))
}

async fn handle_socket(socket: WebSocket, state: AppState, session: Session) {
    let (sender, mut receiver) = socket.split();
    let sender: WsSender = Arc::new(Mutex::new(sender));

    let socket_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("WebSocket connected: {} user: {}", socket_id, session.user_id);

    // The group this socket is viewing
    let (group_tx, group_rx) = watch::channel::<Option<String>>(None);

    let event_task = tokio::spawn(forward_events(
        state.clone(),
        session.clone(),
        sender.clone(),
        group_rx,
    ));

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message: {}", e);
                send_msg(&sender, &ServerMsg::ErrorMessage {
                    message: "Invalid message".to_string(),
                })
                .await;
                continue;
            }
        };

        match dispatch(&state, &session, &group_tx, client_msg).await {
            Ok(Some(reply)) => {
                send_msg(&sender, &reply).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("Request from {} failed: {}", session.user_id, e);
                send_msg(&sender, &ServerMsg::ErrorMessage { message: e.to_string() }).await;
            }
        }
    }

    tracing::info!("WebSocket disconnected: {}", socket_id);
    event_task.abort();
}

/// Pushes a fresh view of the open group whenever its hub reports a change.
async fn forward_events<S>(
    state: AppState,
    session: Session,
    sender: Arc<Mutex<S>>,
    mut group_rx: watch::Receiver<Option<String>>,
) where
    S: Sink<Message> + Unpin + Send,
{
    loop {
        let group_id = group_rx.borrow_and_update().clone();
        let Some(group_id) = group_id else {
            if group_rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        // Subscribe before the first render so no change slips between them.
        let mut event_rx = match state.registry.subscribe(&group_id) {
            Ok((_, events)) => events,
            Err(e) => {
                send_msg(&sender, &ServerMsg::GroupClosed {
                    group_id,
                    message: e.to_string(),
                })
                .await;
                if group_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }
        };
        if !push_view(&state, &session, &sender, &group_id).await {
            return;
        }

        loop {
            tokio::select! {
                changed = group_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                event = event_rx.recv() => {
                    let closed = match event {
                        Ok(GroupEvent::Changed) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            if !push_view(&state, &session, &sender, &group_id).await {
                                return;
                            }
                            None
                        }
                        Ok(GroupEvent::Removed { user_id, message }) if user_id == session.user_id => Some(message),
                        Ok(GroupEvent::Removed { .. }) => None,
                        Ok(GroupEvent::Closed { message }) => Some(message),
                        Err(broadcast::error::RecvError::Closed) => Some("Group not found".to_string()),
                    };

                    if let Some(message) = closed {
                        send_msg(&sender, &ServerMsg::GroupClosed {
                            group_id: group_id.clone(),
                            message,
                        })
                        .await;
                        // Nothing more to show until another group is opened.
                        if group_rx.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Renders the group for this socket's viewer. Returns false once the
/// socket is gone.
async fn push_view<S>(state: &AppState, session: &Session, sender: &Arc<Mutex<S>>, group_id: &str) -> bool
where
    S: Sink<Message> + Unpin,
{
    let msg = match state.store.group_view(group_id, session.viewer(), state.registry.now()) {
        Ok(view) => ServerMsg::GroupView { view },
        Err(e) => ServerMsg::ErrorMessage { message: e.to_string() },
    };
    send_msg(sender, &msg).await
}

async fn touch_user_groups(state: &AppState, user_id: &str) {
    for group in state.store.user_groups(user_id) {
        state.registry.touch(&group.id).await;
    }
}

async fn respond(state: &AppState, session: &Session, group_id: &str, ping_id: String, answer: Answer) -> Result<()> {
    state
        .registry
        .call(group_id, |reply| HubCommand::Respond {
            user_id: session.user_id.clone(),
            ping_id: ping_id.clone(),
            answer,
            reply,
        })
        .await?;
    Ok(())
}

async fn dispatch(
    state: &AppState,
    session: &Session,
    group_tx: &watch::Sender<Option<String>>,
    msg: ClientMsg,
) -> Result<Option<ServerMsg>> {
    let store = &state.store;
    let registry = &state.registry;
    let uid = session.user_id.as_str();
    let now = registry.now();

    let reply = match msg {
        ClientMsg::GetProfile => {
            let user = store
                .get_user(uid)
                .ok_or_else(|| AppError::not_found("Please register to continue"))?;
            Some(ServerMsg::Profile { user })
        }

        ClientMsg::Register { phone_number, display_name } => {
            let user = store.create_user_profile(uid, &phone_number, display_name.as_deref(), now)?;
            touch_user_groups(state, uid).await;
            Some(ServerMsg::Profile { user })
        }

        ClientMsg::SetDisplayName { display_name } => {
            let user = store.set_display_name(uid, &display_name)?;
            touch_user_groups(state, uid).await;
            Some(ServerMsg::Profile { user })
        }

        ClientMsg::LinkRiotAccount { riot_id, region } => {
            let user = store.link_riot_account(uid, &riot_id, &region)?;
            Some(ServerMsg::Profile { user })
        }

        ClientMsg::ReportGameStatus { in_game, elapsed_minutes, game_mode } => {
            let user = store.report_game_status(uid, in_game, elapsed_minutes, game_mode, now)?;
            touch_user_groups(state, uid).await;
            Some(ServerMsg::Profile { user })
        }

        ClientMsg::ListGroups => Some(ServerMsg::GroupList {
            groups: store.group_listings(uid, now),
        }),

        ClientMsg::CreateGroup { name, member_ids } => {
            let group = store.create_group(uid, &name, &member_ids, now)?;
            Some(ServerMsg::GroupCreated { group })
        }

        ClientMsg::OpenGroup { group_id } => {
            let group = store.get_group(&group_id)?;
            if !group.is_member(uid) {
                return Err(AppError::forbidden("Only group members can view this group"));
            }
            group_tx.send_replace(Some(group_id));
            None
        }

        ClientMsg::CloseGroup => {
            group_tx.send_replace(None);
            None
        }

        ClientMsg::InviteByPhone { group_id, phone_number } => {
            registry
                .call(&group_id, |reply| HubCommand::InviteByPhone {
                    user_id: uid.to_string(),
                    phone_number: phone_number.clone(),
                    reply,
                })
                .await?;
            None
        }

        ClientMsg::CreateInviteLink { group_id } => {
            let link = store.create_invite_link(uid, &group_id, now)?;
            Some(ServerMsg::InviteLink {
                url: format!("{}/join/{}", state.base_url, link.token),
                token: link.token,
                expires_at: link.expires_at,
            })
        }

        ClientMsg::JoinViaLink { token } => {
            let group = store.join_group_via_link(uid, &token, now)?;
            registry.touch(&group.id).await;
            Some(ServerMsg::Joined {
                group_id: group.id,
                message: "You have joined the group successfully!".to_string(),
            })
        }

        ClientMsg::RemoveMember { group_id, user_id } => {
            registry
                .call(&group_id, |reply| HubCommand::RemoveMember {
                    user_id: uid.to_string(),
                    member_id: user_id.clone(),
                    reply,
                })
                .await?;
            None
        }

        ClientMsg::ExitGroup { group_id } => {
            registry
                .call(&group_id, |reply| HubCommand::Exit { user_id: uid.to_string(), reply })
                .await?;
            Some(ServerMsg::GroupList {
                groups: store.group_listings(uid, now),
            })
        }

        ClientMsg::DeleteGroup { group_id } => {
            registry
                .call(&group_id, |reply| HubCommand::Delete { user_id: uid.to_string(), reply })
                .await?;
            Some(ServerMsg::GroupList {
                groups: store.group_listings(uid, now),
            })
        }

        ClientMsg::SuggestedStart => {
            let scheduled_at = schedule::next_rounded_10_minutes(now, session.offset_minutes);
            Some(ServerMsg::SuggestedStart {
                scheduled_at,
                label: schedule::format_local_date_time(scheduled_at, now, session.offset_minutes),
                timezone: schedule::timezone_offset_label(session.offset_minutes),
            })
        }

        ClientMsg::CreatePing { group_id, scheduled_at } => {
            registry
                .call(&group_id, |reply| HubCommand::CreatePing {
                    user_id: uid.to_string(),
                    scheduled_at,
                    reply,
                })
                .await?;
            None
        }

        ClientMsg::RespondEta { group_id, ping_id, minutes } => {
            respond(state, session, &group_id, ping_id, Answer::Eta(minutes)).await?;
            None
        }

        ClientMsg::RespondNextRound { group_id, ping_id } => {
            respond(state, session, &group_id, ping_id, Answer::NextRound).await?;
            None
        }

        ClientMsg::RespondNotToday { group_id, ping_id } => {
            respond(state, session, &group_id, ping_id, Answer::NotToday).await?;
            None
        }
    };

    Ok(reply)
}

/// Returns false once the socket is gone.
async fn send_msg<S>(sender: &Arc<Mutex<S>>, msg: &ServerMsg) -> bool
where
    S: Sink<Message> + Unpin,
{
    let Ok(json) = serde_json::to_string(msg) else { return true };
    let mut s = sender.lock().await;
    s.send(Message::Text(json.into())).await.is_ok()
}

// ─── Persistence ──────────────────────────────────────────────────

fn spawn_snapshots(store: Arc<Store>, path: PathBuf, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (store, path) = (store.clone(), path.clone());
            match tokio::task::spawn_blocking(move || store.save_snapshot(&path)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Snapshot failed: {}", e),
                Err(e) => tracing::error!("Snapshot task panicked: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    config::init()?;
    let env = ServerEnv::from_env()?;
    let settings: Settings = config::load_settings()?;

    let store = Arc::new(Store::new(settings.clone()));
    if let Some(path) = &env.data_path {
        store.load_snapshot(path)?;
        spawn_snapshots(store.clone(), path.clone(), Duration::from_secs(settings.snapshot_interval_secs));
    }

    let registry = Registry::new(store.clone());

    let state = AppState {
        store: store.clone(),
        registry,
        base_url: env.base_url.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/groups/{group_id}", get(group_page))
        .route("/join/{token}", get(invite_page))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", env.port)).await?;

    tracing::info!("GameTime server running on port {}", env.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(path) = &env.data_path {
        store.save_snapshot(path)?;
        tracing::info!("Snapshot saved to {}", path.display());
    }
    Ok(())
}
