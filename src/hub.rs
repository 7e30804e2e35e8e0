use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::schedule;
use crate::store::{ExitOutcome, PhoneInviteOutcome, Store};
use crate::types::Ping;

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

type Reply<T> = oneshot::Sender<Result<T>>;

/// A member's answer to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Eta(i64),
    NextRound,
    NotToday,
}

/// Commands the WebSocket handler sends to a group hub.
#[derive(Debug)]
pub enum HubCommand {
    CreatePing {
        user_id: String,
        scheduled_at: Option<i64>,
        reply: Reply<Ping>,
    },
    Respond {
        user_id: String,
        ping_id: String,
        answer: Answer,
        reply: Reply<Ping>,
    },
    InviteByPhone {
        user_id: String,
        phone_number: String,
        reply: Reply<PhoneInviteOutcome>,
    },
    RemoveMember {
        user_id: String,
        member_id: String,
        reply: Reply<()>,
    },
    Exit {
        user_id: String,
        reply: Reply<ExitOutcome>,
    },
    Delete {
        user_id: String,
        reply: Reply<()>,
    },
    /// The group changed outside the hub (profile edits, link joins).
    Touch,
}

/// Events broadcast from a hub to the sockets viewing its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// Group or ping data changed; viewers re-render.
    Changed,
    /// One member no longer belongs to the group.
    Removed { user_id: String, message: String },
    /// The group is gone.
    Closed { message: String },
}

#[derive(Clone)]
pub struct HubHandle {
    pub group_id: String,
    instance: Uuid,
    pub cmd_tx: mpsc::Sender<HubCommand>,
    pub event_tx: broadcast::Sender<GroupEvent>,
}

/// Registry holds the store and every running group hub.
pub struct Registry {
    pub store: Arc<Store>,
    /// group_id -> hub
    hubs: DashMap<String, HubHandle>,
    sweep_every: Duration,
    clock: Clock,
}

impl Registry {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        let sweep_every = Duration::from_secs(store.settings().sweep_interval_secs);
        Self::with_clock(store, sweep_every, Arc::new(schedule::now_ms))
    }

    pub fn with_clock(store: Arc<Store>, sweep_every: Duration, clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            store,
            hubs: DashMap::new(),
            sweep_every,
            clock,
        })
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn active_hubs(&self) -> usize {
        self.hubs.len()
    }

    /// Returns the hub for a group, starting it if needed.
    pub fn hub(self: &Arc<Self>, group_id: &str) -> Result<HubHandle> {
        self.store.get_group(group_id)?;
        let handle = self
            .hubs
            .entry(group_id.to_string())
            .or_insert_with(|| spawn_hub(self.clone(), group_id.to_string()))
            .clone();
        Ok(handle)
    }

    /// Subscribes to a group's events, starting its hub if needed.
    ///
    /// The subscription is taken under the registry entry, so an idle hub
    /// cannot retire between lookup and subscribe.
    pub fn subscribe(self: &Arc<Self>, group_id: &str) -> Result<(HubHandle, broadcast::Receiver<GroupEvent>)> {
        self.store.get_group(group_id)?;
        let entry = self
            .hubs
            .entry(group_id.to_string())
            .or_insert_with(|| spawn_hub(self.clone(), group_id.to_string()));
        let events = entry.event_tx.subscribe();
        Ok((entry.clone(), events))
    }

    /// Tells a running hub that its group changed. No-op when idle.
    pub async fn touch(&self, group_id: &str) {
        let handle = self.hubs.get(group_id).map(|h| h.clone());
        if let Some(handle) = handle {
            let _ = handle.cmd_tx.send(HubCommand::Touch).await;
        }
    }

    /// Sends a command to a group's hub and waits for its reply.
    pub async fn call<T>(
        self: &Arc<Self>,
        group_id: &str,
        make: impl Fn(Reply<T>) -> HubCommand,
    ) -> Result<T> {
        // A hub may stop between lookup and send; the retry gets a fresh one.
        for _ in 0..2 {
            let handle = self.hub(group_id)?;
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle.cmd_tx.send(make(reply_tx)).await.is_err() {
                self.forget(&handle);
                continue;
            }
            return reply_rx
                .await
                .map_err(|_| AppError::not_found("Group not found"))?;
        }
        Err(AppError::not_found("Group not found"))
    }

    /// Unregisters a hub nobody is watching. Checked under the registry
    /// entry so it cannot race `subscribe`.
    fn retire_if_idle(&self, handle: &HubHandle) -> bool {
        self.hubs
            .remove_if(&handle.group_id, |_, h| {
                h.instance == handle.instance && h.event_tx.receiver_count() == 0
            })
            .is_some()
    }

    fn forget(&self, handle: &HubHandle) {
        self.hubs
            .remove_if(&handle.group_id, |_, h| h.instance == handle.instance);
    }
}

/// Create a hub for a group and spawn its task. Returns the hub handle.
fn spawn_hub(registry: Arc<Registry>, group_id: String) -> HubHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, _) = broadcast::channel(256);

    let handle = HubHandle {
        group_id: group_id.clone(),
        instance: Uuid::new_v4(),
        cmd_tx,
        event_tx,
    };

    tokio::spawn(hub_task(handle.clone(), cmd_rx, registry));
    tracing::info!("Hub started for group {}", group_id);

    handle
}

/// Whether the hub keeps running after a command.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

async fn hub_task(handle: HubHandle, mut cmd_rx: mpsc::Receiver<HubCommand>, registry: Arc<Registry>) {
    let mut sweep = tokio::time::interval(registry.sweep_every);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    sweep.tick().await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if handle_command(&handle, &registry, cmd) == Flow::Stop {
                    break;
                }
            }
            _ = sweep.tick() => {
                if handle_sweep(&handle, &registry) == Flow::Stop {
                    break;
                }
            }
        }
    }

    registry.forget(&handle);
    cmd_rx.close();
    // Commands queued before the close still get answers.
    while let Ok(cmd) = cmd_rx.try_recv() {
        handle_command(&handle, &registry, cmd);
    }

    tracing::info!("Hub for group {} stopped", handle.group_id);
}

fn broadcast(handle: &HubHandle, event: GroupEvent) {
    let _ = handle.event_tx.send(event);
}

fn handle_command(handle: &HubHandle, registry: &Registry, cmd: HubCommand) -> Flow {
    let store = &registry.store;
    let gid = handle.group_id.as_str();
    let now = registry.now();

    match cmd {
        HubCommand::CreatePing { user_id, scheduled_at, reply } => {
            let result = store.create_ping(&user_id, gid, scheduled_at, now);
            if result.is_ok() {
                broadcast(handle, GroupEvent::Changed);
            }
            let _ = reply.send(result);
        }
        HubCommand::Respond { user_id, ping_id, answer, reply } => {
            let result = match answer {
                Answer::Eta(minutes) => store.respond_eta(&user_id, gid, &ping_id, minutes, now),
                Answer::NextRound => store.respond_next_round(&user_id, gid, &ping_id, now),
                Answer::NotToday => store.respond_not_today(&user_id, gid, &ping_id, now),
            };
            if result.is_ok() {
                broadcast(handle, GroupEvent::Changed);
            }
            let _ = reply.send(result);
        }
        HubCommand::InviteByPhone { user_id, phone_number, reply } => {
            let result = store.invite_member_by_phone(&user_id, gid, &phone_number);
            if let Ok(PhoneInviteOutcome::Added { user_id }) = &result {
                tracing::info!("{} added to group {} by phone", user_id, gid);
                broadcast(handle, GroupEvent::Changed);
            }
            let _ = reply.send(result);
        }
        HubCommand::RemoveMember { user_id, member_id, reply } => {
            let result = store.remove_member(&user_id, gid, &member_id);
            if result.is_ok() {
                broadcast(handle, GroupEvent::Removed {
                    user_id: member_id,
                    message: "You were removed from the group".to_string(),
                });
                broadcast(handle, GroupEvent::Changed);
            }
            let _ = reply.send(result);
        }
        HubCommand::Exit { user_id, reply } => {
            let result = store.exit_group(&user_id, gid);
            let flow = match &result {
                Ok(ExitOutcome::Deleted) => {
                    broadcast(handle, GroupEvent::Closed {
                        message: "The group no longer has members".to_string(),
                    });
                    Flow::Stop
                }
                Ok(ExitOutcome::Left { new_owner }) => {
                    if let Some(owner) = new_owner {
                        tracing::info!("{} now owns group {}", owner, gid);
                    }
                    broadcast(handle, GroupEvent::Removed {
                        user_id: user_id.clone(),
                        message: "You left the group".to_string(),
                    });
                    broadcast(handle, GroupEvent::Changed);
                    Flow::Continue
                }
                Err(_) => Flow::Continue,
            };
            let _ = reply.send(result);
            return flow;
        }
        HubCommand::Delete { user_id, reply } => {
            let result = store.delete_group(&user_id, gid);
            let flow = if result.is_ok() {
                broadcast(handle, GroupEvent::Closed {
                    message: "The group was deleted".to_string(),
                });
                Flow::Stop
            } else {
                Flow::Continue
            };
            let _ = reply.send(result);
            return flow;
        }
        HubCommand::Touch => {
            broadcast(handle, GroupEvent::Changed);
        }
    }

    Flow::Continue
}

fn handle_sweep(handle: &HubHandle, registry: &Registry) -> Flow {
    let store = &registry.store;
    let gid = handle.group_id.as_str();
    let now = registry.now();

    if store.get_group(gid).is_err() {
        broadcast(handle, GroupEvent::Closed {
            message: "Group not found".to_string(),
        });
        return Flow::Stop;
    }

    let expired = store.prune_expired(gid, now);
    if !expired.is_empty() {
        tracing::debug!("Expired {} ping(s) in group {}", expired.len(), gid);
        broadcast(handle, GroupEvent::Changed);
    }

    let stale_links = store.prune_invite_links(now);
    if stale_links > 0 {
        tracing::debug!("Dropped {} expired invite link(s)", stale_links);
    }

    if !store.has_active_pings(gid, now) && registry.retire_if_idle(handle) {
        return Flow::Stop;
    }
    Flow::Continue
}
