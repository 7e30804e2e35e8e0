//! In-process document store.
//!
//! Mirrors the realtime-database tree the mobile client used
//! (`users`, `groups`, `userGroups`, `pings`, `phoneInvites`, `inviteLinks`).
//! Each tree is its own `DashMap`; never hold a guard on one tree while
//! writing to the same tree.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{self, Viewer};
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::riot::{self, Region};
use crate::schedule::{self, HOUR_MS, MINUTE_MS};
use crate::types::*;

const INVITE_TOKEN_LEN: usize = 12;

/// What happened when a member left a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Left { new_owner: Option<String> },
    Deleted,
}

/// What happened when a phone number was invited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneInviteOutcome {
    Added { user_id: String },
    AlreadyMember,
    Pending,
}

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Snapshot {
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    user_groups: HashMap<String, Vec<String>>,
    pings: HashMap<String, Vec<Ping>>,
    phone_invites: HashMap<String, Vec<String>>,
    invite_links: HashMap<String, InviteLink>,
}

pub struct Store {
    settings: Settings,
    users: DashMap<String, User>,
    /// phone number -> uid
    phone_to_uid: DashMap<String, String>,
    groups: DashMap<String, Group>,
    /// uid -> group ids
    user_groups: DashMap<String, Vec<String>>,
    /// group id -> pings
    pings: DashMap<String, Vec<Ping>>,
    /// phone number -> group ids waiting for that number to register
    phone_invites: DashMap<String, Vec<String>>,
    /// token -> link
    invite_links: DashMap<String, InviteLink>,
}

fn create_invite_token() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(INVITE_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn clean_name(raw: &str, max_len: usize, what: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::invalid(format!("Please enter a {}", what)));
    }
    if name.chars().count() > max_len {
        return Err(AppError::invalid(format!("{} cannot exceed {} characters", capitalize(what), max_len)));
    }
    Ok(name.to_string())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Store {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            users: DashMap::new(),
            phone_to_uid: DashMap::new(),
            groups: DashMap::new(),
            user_groups: DashMap::new(),
            pings: DashMap::new(),
            phone_invites: DashMap::new(),
            invite_links: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ─── Users ────────────────────────────────────────────────────────

    /// Create or update a profile and claim any phone invites for it.
    pub fn create_user_profile(
        &self,
        uid: &str,
        phone_number: &str,
        display_name: Option<&str>,
        now: i64,
    ) -> Result<User> {
        let phone = phone_number.trim().to_string();
        if phone.is_empty() {
            return Err(AppError::invalid("Phone number is required"));
        }
        let display_name = display_name
            .filter(|n| !n.trim().is_empty())
            .map(|n| clean_name(n, self.settings.max_display_name_len, "display name"))
            .transpose()?;

        // Claim the number before touching the profile so two users can
        // never hold it at once.
        match self.phone_to_uid.entry(phone.clone()) {
            Entry::Occupied(owner) if owner.get().as_str() != uid => {
                return Err(AppError::Conflict("Phone number already registered".into()));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(uid.to_string());
            }
        }

        let user = {
            let mut entry = self.users.entry(uid.to_string()).or_insert_with(|| User {
                id: uid.to_string(),
                phone_number: phone.clone(),
                display_name: None,
                created_at: now,
                riot_account: None,
                game_status: None,
            });
            if entry.phone_number != phone {
                self.phone_to_uid.remove_if(&entry.phone_number, |_, owner| owner == uid);
                entry.phone_number = phone.clone();
            }
            if display_name.is_some() {
                entry.display_name = display_name;
            }
            entry.clone()
        };

        if let Some((_, group_ids)) = self.phone_invites.remove(&phone) {
            for gid in group_ids {
                match self.add_member(&gid, uid) {
                    Ok(true) => tracing::info!("User {} joined group {} via phone invite", uid, gid),
                    Ok(false) => {}
                    Err(e) => tracing::debug!("Skipping phone invite to {}: {}", gid, e),
                }
            }
        }

        tracing::info!("User profile saved for {}", uid);
        Ok(user)
    }

    pub fn get_user(&self, uid: &str) -> Option<User> {
        self.users.get(uid).map(|u| u.clone())
    }

    fn update_user(&self, uid: &str, f: impl FnOnce(&mut User)) -> Result<User> {
        let mut user = self
            .users
            .get_mut(uid)
            .ok_or_else(|| AppError::not_found("Please register before updating your profile"))?;
        f(&mut user);
        Ok(user.clone())
    }

    pub fn set_display_name(&self, uid: &str, display_name: &str) -> Result<User> {
        let name = clean_name(display_name, self.settings.max_display_name_len, "display name")?;
        self.update_user(uid, |u| u.display_name = Some(name))
    }

    pub fn link_riot_account(&self, uid: &str, riot_id: &str, region: &str) -> Result<User> {
        let parsed = riot::parse_riot_id(riot_id)
            .ok_or_else(|| AppError::invalid("Riot ID must look like Name#TAG"))?;
        let region: Region = region.parse()?;
        tracing::info!(
            "Linking {}#{} on {} ({:?} routing) for {}",
            parsed.game_name,
            parsed.tag_line,
            region,
            region.super_region(),
            uid
        );
        self.update_user(uid, |u| {
            u.riot_account = Some(RiotAccount {
                game_name: parsed.game_name,
                tag_line: parsed.tag_line,
                region,
            })
        })
    }

    pub fn report_game_status(
        &self,
        uid: &str,
        in_game: bool,
        elapsed_minutes: Option<u32>,
        game_mode: Option<String>,
        now: i64,
    ) -> Result<User> {
        self.update_user(uid, |u| {
            u.game_status = Some(GameStatus {
                in_game,
                elapsed_minutes: elapsed_minutes.filter(|_| in_game),
                game_mode: game_mode.filter(|_| in_game),
                reported_at: now,
            })
        })
    }

    /// Display names for the given uids; users without one are omitted.
    pub fn display_names<'a>(&self, uids: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
        uids.into_iter()
            .filter_map(|uid| {
                let user = self.users.get(uid)?;
                let name = user.display_name.clone()?;
                Some((uid.to_string(), name))
            })
            .collect()
    }

    // ─── Groups ───────────────────────────────────────────────────────

    pub fn create_group(&self, creator: &str, name: &str, member_ids: &[String], now: i64) -> Result<Group> {
        let name = clean_name(name, self.settings.max_group_name_len, "group name")?;

        let mut members = vec![creator.to_string()];
        for uid in member_ids.iter().map(|m| m.trim()).filter(|m| !m.is_empty()) {
            if !members.iter().any(|m| m == uid) {
                members.push(uid.to_string());
            }
        }

        let group = Group {
            id: Uuid::new_v4().to_string(),
            name,
            created_by: creator.to_string(),
            created_at: now,
            members_by_uid: members,
            last_ping: None,
            current_game: None,
        };

        self.groups.insert(group.id.clone(), group.clone());
        for uid in &group.members_by_uid {
            self.index_membership(uid, &group.id);
        }

        tracing::info!("Group created: {} ({}) by {}", group.name, group.id, creator);
        Ok(group)
    }

    pub fn get_group(&self, gid: &str) -> Result<Group> {
        self.groups
            .get(gid)
            .map(|g| g.clone())
            .ok_or_else(|| AppError::not_found("Group not found"))
    }

    /// Groups the user belongs to, most recent activity first.
    pub fn user_groups(&self, uid: &str) -> Vec<Group> {
        let ids = self.user_groups.get(uid).map(|ids| ids.clone()).unwrap_or_default();
        let mut groups: Vec<Group> = ids.iter().filter_map(|gid| self.get_group(gid).ok()).collect();
        groups.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.name.cmp(&b.name))
        });
        groups
    }

    pub fn update_group_last_ping(&self, gid: &str, game_name: Option<&str>, now: i64) -> Result<()> {
        let mut group = self
            .groups
            .get_mut(gid)
            .ok_or_else(|| AppError::not_found("Group not found"))?;
        group.last_ping = Some(now);
        if let Some(game) = game_name.map(str::trim).filter(|g| !g.is_empty()) {
            group.current_game = Some(game.to_string());
        }
        Ok(())
    }

    /// Returns `false` when the user was already a member.
    pub fn add_member(&self, gid: &str, uid: &str) -> Result<bool> {
        {
            let mut group = self
                .groups
                .get_mut(gid)
                .ok_or_else(|| AppError::not_found("Group not found"))?;
            if group.is_member(uid) {
                return Ok(false);
            }
            group.members_by_uid.push(uid.to_string());
        }
        self.index_membership(uid, gid);
        Ok(true)
    }

    pub fn remove_member(&self, actor: &str, gid: &str, uid: &str) -> Result<()> {
        {
            let mut group = self
                .groups
                .get_mut(gid)
                .ok_or_else(|| AppError::not_found("Group not found"))?;
            if group.created_by != actor {
                return Err(AppError::forbidden("Only the group creator can remove members"));
            }
            if group.created_by == uid {
                return Err(AppError::invalid("The group creator cannot be removed"));
            }
            if !group.is_member(uid) {
                return Err(AppError::not_found("User is not a member of this group"));
            }
            group.members_by_uid.retain(|m| m != uid);
        }
        self.unindex_membership(uid, gid);
        tracing::info!("Removed {} from group {}", uid, gid);
        Ok(())
    }

    /// Leaves a group. Ownership passes to the longest-standing member and
    /// the last member out deletes the group.
    pub fn exit_group(&self, uid: &str, gid: &str) -> Result<ExitOutcome> {
        let outcome = {
            let mut group = self
                .groups
                .get_mut(gid)
                .ok_or_else(|| AppError::not_found("Group not found"))?;
            if !group.is_member(uid) {
                return Err(AppError::not_found("You are not a member of this group"));
            }
            group.members_by_uid.retain(|m| m != uid);

            match group.members_by_uid.first().cloned() {
                None => ExitOutcome::Deleted,
                Some(next) if group.created_by == uid => {
                    group.created_by = next.clone();
                    ExitOutcome::Left { new_owner: Some(next) }
                }
                Some(_) => ExitOutcome::Left { new_owner: None },
            }
        };

        self.unindex_membership(uid, gid);
        if outcome == ExitOutcome::Deleted {
            self.purge_group(gid);
        }
        tracing::info!("{} left group {}: {:?}", uid, gid, outcome);
        Ok(outcome)
    }

    pub fn delete_group(&self, actor: &str, gid: &str) -> Result<()> {
        let group = self.get_group(gid)?;
        if group.created_by != actor {
            return Err(AppError::forbidden("Only the group creator can delete the group"));
        }
        self.purge_group(gid);
        tracing::info!("Group deleted: {}", gid);
        Ok(())
    }

    fn purge_group(&self, gid: &str) {
        if let Some((_, group)) = self.groups.remove(gid) {
            for uid in &group.members_by_uid {
                self.unindex_membership(uid, gid);
            }
        }
        self.pings.remove(gid);
        self.invite_links.retain(|_, link| link.group_id != gid);
        self.phone_invites.retain(|_, gids| {
            gids.retain(|g| g != gid);
            !gids.is_empty()
        });
    }

    fn index_membership(&self, uid: &str, gid: &str) {
        let mut ids = self.user_groups.entry(uid.to_string()).or_default();
        if !ids.iter().any(|g| g == gid) {
            ids.push(gid.to_string());
        }
    }

    fn unindex_membership(&self, uid: &str, gid: &str) {
        self.user_groups.remove_if_mut(uid, |_, ids| {
            ids.retain(|g| g != gid);
            ids.is_empty()
        });
    }

    fn require_member(&self, uid: &str, gid: &str, action: &str) -> Result<Group> {
        let group = self.get_group(gid)?;
        if !group.is_member(uid) {
            return Err(AppError::forbidden(format!("Only group members can {}", action)));
        }
        Ok(group)
    }

    // ─── Invites ──────────────────────────────────────────────────────

    pub fn invite_member_by_phone(&self, actor: &str, gid: &str, phone_number: &str) -> Result<PhoneInviteOutcome> {
        self.require_member(actor, gid, "invite")?;
        let phone = phone_number.trim();
        if phone.is_empty() {
            return Err(AppError::invalid("Phone number is required"));
        }

        let existing = self.phone_to_uid.get(phone).map(|uid| uid.clone());
        if let Some(uid) = existing {
            return Ok(if self.add_member(gid, &uid)? {
                PhoneInviteOutcome::Added { user_id: uid }
            } else {
                PhoneInviteOutcome::AlreadyMember
            });
        }

        let mut gids = self.phone_invites.entry(phone.to_string()).or_default();
        if !gids.iter().any(|g| g == gid) {
            gids.push(gid.to_string());
        }
        Ok(PhoneInviteOutcome::Pending)
    }

    pub fn create_invite_link(&self, actor: &str, gid: &str, now: i64) -> Result<InviteLink> {
        self.require_member(actor, gid, "share invite links")?;
        self.prune_invite_links(now);
        let link = InviteLink {
            token: create_invite_token(),
            group_id: gid.to_string(),
            created_by: actor.to_string(),
            expires_at: now + self.settings.invite_ttl_hours * HOUR_MS,
        };
        self.invite_links.insert(link.token.clone(), link.clone());
        Ok(link)
    }

    /// Drops expired invite links and returns how many went.
    pub fn prune_invite_links(&self, now: i64) -> usize {
        let before = self.invite_links.len();
        self.invite_links.retain(|_, link| now < link.expires_at);
        before.saturating_sub(self.invite_links.len())
    }

    fn live_link(&self, token: &str, now: i64) -> Result<(InviteLink, Group)> {
        let link = self
            .invite_links
            .get(token.trim())
            .map(|l| l.clone())
            .ok_or_else(|| AppError::invalid("Invalid invite link"))?;
        if now >= link.expires_at {
            return Err(AppError::Expired("This invite link has expired".into()));
        }
        let group = self
            .get_group(&link.group_id)
            .map_err(|_| AppError::not_found("Group not found or has been deleted"))?;
        Ok((link, group))
    }

    pub fn invite_preview(&self, token: &str, now: i64) -> Result<InvitePreview> {
        let (link, group) = self.live_link(token, now)?;
        Ok(InvitePreview {
            group_id: group.id,
            group_name: group.name,
            member_count: group.members_by_uid.len(),
            expires_at: link.expires_at,
        })
    }

    pub fn join_group_via_link(&self, uid: &str, token: &str, now: i64) -> Result<Group> {
        let (_, group) = self.live_link(token, now)?;
        if group.is_member(uid) {
            return Err(AppError::Conflict("You are already a member of this group".into()));
        }
        self.add_member(&group.id, uid)?;
        tracing::info!("{} joined group {} via invite link", uid, group.id);
        self.get_group(&group.id)
    }

    // ─── Pings ────────────────────────────────────────────────────────

    /// Starts a ping. The creator is counted in at the base time.
    pub fn create_ping(&self, actor: &str, gid: &str, scheduled_at: Option<i64>, now: i64) -> Result<Ping> {
        self.require_member(actor, gid, "send pings")?;

        let window = self.settings.ping_window_minutes * MINUTE_MS;
        let horizon = self.settings.max_schedule_ahead_hours * HOUR_MS;
        let base = scheduled_at.unwrap_or(now);
        if base.saturating_sub(now) > horizon {
            return Err(AppError::invalid(format!(
                "Pings can be scheduled at most {} hours ahead",
                self.settings.max_schedule_ahead_hours
            )));
        }
        let expires_at = base
            .checked_add(window)
            .ok_or_else(|| AppError::invalid("Invalid scheduled time"))?;
        if expires_at <= now {
            return Err(AppError::invalid("Scheduled time has already passed"));
        }

        let mut ping = Ping {
            id: Uuid::new_v4().to_string(),
            group_id: gid.to_string(),
            created_by: actor.to_string(),
            created_at: now,
            scheduled_at,
            expires_at,
            responses: Vec::new(),
        };
        ping.set_response(actor, PingResponse::eta(0, now));

        self.pings.entry(gid.to_string()).or_default().push(ping.clone());
        self.update_group_last_ping(gid, None, now)?;

        tracing::info!("Ping {} created in group {} for {}", ping.id, gid, ping.base_time());
        Ok(ping)
    }

    /// Unexpired pings, newest first.
    pub fn active_pings(&self, gid: &str, now: i64) -> Result<Vec<Ping>> {
        self.get_group(gid)?;
        let mut pings: Vec<Ping> = self
            .pings
            .get(gid)
            .map(|p| p.iter().filter(|p| !p.is_expired(now)).cloned().collect())
            .unwrap_or_default();
        pings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pings)
    }

    fn respond(&self, actor: &str, gid: &str, ping_id: &str, response: PingResponse) -> Result<Ping> {
        self.require_member(actor, gid, "respond to pings")?;
        let now = response.responded_at;

        let mut pings = self
            .pings
            .get_mut(gid)
            .ok_or_else(|| AppError::not_found("Ping not found"))?;
        let ping = pings
            .iter_mut()
            .find(|p| p.id == ping_id)
            .ok_or_else(|| AppError::not_found("Ping not found"))?;
        if ping.is_expired(now) {
            return Err(AppError::Expired("This ping has expired".into()));
        }
        ping.set_response(actor, response);
        Ok(ping.clone())
    }

    pub fn respond_eta(&self, actor: &str, gid: &str, ping_id: &str, minutes: i64, now: i64) -> Result<Ping> {
        if !(0..=self.settings.ping_window_minutes).contains(&minutes) {
            return Err(AppError::invalid(format!(
                "ETA must be between 0 and {} minutes",
                self.settings.ping_window_minutes
            )));
        }
        self.respond(actor, gid, ping_id, PingResponse::eta(minutes, now))
    }

    pub fn respond_next_round(&self, actor: &str, gid: &str, ping_id: &str, now: i64) -> Result<Ping> {
        self.respond(actor, gid, ping_id, PingResponse::next_round(now))
    }

    pub fn respond_not_today(&self, actor: &str, gid: &str, ping_id: &str, now: i64) -> Result<Ping> {
        self.respond(actor, gid, ping_id, PingResponse::declined(now))
    }

    /// Drops expired pings and returns their ids.
    pub fn prune_expired(&self, gid: &str, now: i64) -> Vec<String> {
        let mut removed = Vec::new();
        self.pings.remove_if_mut(gid, |_, pings| {
            pings.retain(|p| {
                let expired = p.is_expired(now);
                if expired {
                    removed.push(p.id.clone());
                }
                !expired
            });
            pings.is_empty()
        });
        removed
    }

    pub fn has_active_pings(&self, gid: &str, now: i64) -> bool {
        self.pings
            .get(gid)
            .is_some_and(|p| p.iter().any(|p| !p.is_expired(now)))
    }

    // ─── Views ────────────────────────────────────────────────────────

    pub fn group_view(&self, gid: &str, viewer: Viewer<'_>, now: i64) -> Result<GroupView> {
        let group = self.get_group(gid)?;
        let pings = self.active_pings(gid, now)?;

        let uids = group
            .members_by_uid
            .iter()
            .map(String::as_str)
            .chain(pings.iter().flat_map(|p| p.responses.iter().map(|r| r.user_id.as_str())));
        let names = self.display_names(uids);

        let members = group
            .members_by_uid
            .iter()
            .map(|uid| MemberView {
                user_id: uid.clone(),
                name: names.get(uid).cloned().unwrap_or_else(|| "Member".to_string()),
                is_creator: *uid == group.created_by,
                game_status: self.users.get(uid).and_then(|u| u.game_status.clone()),
            })
            .collect();

        let summaries = pings
            .iter()
            .map(|p| aggregate::summarize(p, &group, &names, viewer, now, &self.settings.eta_options))
            .collect();

        Ok(GroupView { group, members, pings: summaries })
    }

    pub fn group_listings(&self, uid: &str, now: i64) -> Vec<GroupListing> {
        self.user_groups(uid)
            .into_iter()
            .map(|g| GroupListing {
                member_count: g.members_by_uid.len(),
                last_ping_label: g
                    .last_ping
                    .map(|t| schedule::time_since(t, now))
                    .unwrap_or_else(|| "Never".to_string()),
                id: g.id,
                name: g.name,
            })
            .collect()
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Clears every tree.
    pub fn reset(&self) {
        self.users.clear();
        self.phone_to_uid.clear();
        self.groups.clear();
        self.user_groups.clear();
        self.pings.clear();
        self.phone_invites.clear();
        self.invite_links.clear();
        tracing::warn!("Store reset");
    }

    fn snapshot(&self) -> Snapshot {
        fn collect<V: Clone>(map: &DashMap<String, V>) -> HashMap<String, V> {
            map.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
        }
        Snapshot {
            users: collect(&self.users),
            groups: collect(&self.groups),
            user_groups: collect(&self.user_groups),
            pings: collect(&self.pings),
            phone_invites: collect(&self.phone_invites),
            invite_links: collect(&self.invite_links),
        }
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        tracing::debug!("Snapshot written to {}", path.display());
        Ok(())
    }

    /// Replaces the store contents with a snapshot. A missing file leaves
    /// the store empty.
    pub fn load_snapshot(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            tracing::info!("No snapshot at {}, starting empty", path.display());
            return Ok(());
        }
        let data = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&data)?;

        self.reset();
        for (uid, user) in snapshot.users {
            self.phone_to_uid.insert(user.phone_number.clone(), uid.clone());
            self.users.insert(uid, user);
        }
        for (gid, group) in snapshot.groups {
            self.groups.insert(gid, group);
        }
        for (uid, gids) in snapshot.user_groups {
            self.user_groups.insert(uid, gids);
        }
        for (gid, pings) in snapshot.pings {
            self.pings.insert(gid, pings);
        }
        for (phone, gids) in snapshot.phone_invites {
            self.phone_invites.insert(phone, gids);
        }
        for (token, link) in snapshot.invite_links {
            self.invite_links.insert(token, link);
        }

        tracing::info!(
            "Loaded snapshot from {}: {} users, {} groups",
            path.display(),
            self.users.len(),
            self.groups.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: i64 = 1_710_097_200_000; // 2024-03-10 19:00 UTC

    fn store() -> Store {
        Store::new(Settings::default())
    }

    fn squad(store: &Store) -> Group {
        for (uid, phone, name) in [("ann", "+1555000001", "Ann"), ("ben", "+1555000002", "Ben")] {
            store.create_user_profile(uid, phone, Some(name), NOW).unwrap();
        }
        store
            .create_group("ann", "  Friday Squad ", &["ben".to_string(), "ann".to_string()], NOW)
            .unwrap()
    }

    #[test]
    fn create_group_normalises_members_and_indexes() {
        let s = store();
        let g = squad(&s);
        assert_eq!(g.name, "Friday Squad");
        assert_eq!(g.members_by_uid, vec!["ann", "ben"]);
        assert_eq!(s.user_groups("ben").len(), 1);
        assert_eq!(s.get_group(&g.id).unwrap(), g);
    }

    #[test]
    fn rejects_blank_or_long_group_names() {
        let s = store();
        assert!(matches!(s.create_group("ann", "   ", &[], NOW), Err(AppError::InvalidInput(_))));
        let long = "x".repeat(41);
        let err = s.create_group("ann", &long, &[], NOW).unwrap_err();
        assert_eq!(err.to_string(), "Group name cannot exceed 40 characters");
    }

    #[test]
    fn user_groups_sorted_by_recent_activity() {
        let s = store();
        let a = s.create_group("ann", "Alpha", &[], NOW).unwrap();
        s.create_group("ann", "Bravo", &[], NOW + 1).unwrap();
        s.create_ping("ann", &a.id, None, NOW + 10).unwrap();

        let names: Vec<String> = s.user_groups("ann").into_iter().map(|g| g.name).collect();
        assert_eq!(names, ["Alpha", "Bravo"]);
    }

    #[test]
    fn phone_numbers_are_unique_per_user() {
        let s = store();
        s.create_user_profile("ann", "+1555000001", None, NOW).unwrap();
        let err = s.create_user_profile("ben", "+1555000001", None, NOW).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        // re-registering keeps the original creation time
        let again = s.create_user_profile("ann", "+1555000001", Some("Ann"), NOW + 5).unwrap();
        assert_eq!(again.created_at, NOW);
        assert_eq!(again.display_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn phone_invite_is_claimed_on_registration() {
        let s = store();
        let g = squad(&s);
        let outcome = s.invite_member_by_phone("ben", &g.id, " +1555000003 ").unwrap();
        assert_eq!(outcome, PhoneInviteOutcome::Pending);

        s.create_user_profile("cat", "+1555000003", Some("Cat"), NOW).unwrap();
        assert!(s.get_group(&g.id).unwrap().is_member("cat"));
        assert_eq!(s.user_groups("cat")[0].id, g.id);
    }

    #[test]
    fn phone_invite_adds_registered_user_at_once() {
        let s = store();
        let g = squad(&s);
        s.create_user_profile("cat", "+1555000003", None, NOW).unwrap();

        let outcome = s.invite_member_by_phone("ann", &g.id, "+1555000003").unwrap();
        assert_eq!(outcome, PhoneInviteOutcome::Added { user_id: "cat".into() });
        let again = s.invite_member_by_phone("ann", &g.id, "+1555000003").unwrap();
        assert_eq!(again, PhoneInviteOutcome::AlreadyMember);

        let err = s.invite_member_by_phone("zed", &g.id, "+1555000009").unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn invite_link_join_flow() {
        let s = store();
        let g = squad(&s);
        let link = s.create_invite_link("ann", &g.id, NOW).unwrap();
        assert_eq!(link.token.len(), INVITE_TOKEN_LEN);
        assert_eq!(link.expires_at, NOW + 48 * HOUR_MS);

        let preview = s.invite_preview(&link.token, NOW).unwrap();
        assert_eq!(preview.group_name, "Friday Squad");
        assert_eq!(preview.member_count, 2);

        let joined = s.join_group_via_link("cat", &link.token, NOW + 1).unwrap();
        assert!(joined.is_member("cat"));

        let err = s.join_group_via_link("cat", &link.token, NOW + 2).unwrap_err();
        assert_eq!(err.to_string(), "You are already a member of this group");
    }

    #[test]
    fn invite_link_errors() {
        let s = store();
        let g = squad(&s);
        let link = s.create_invite_link("ann", &g.id, NOW).unwrap();

        let err = s.join_group_via_link("cat", "nope", NOW).unwrap_err();
        assert_eq!(err.to_string(), "Invalid invite link");

        let err = s.join_group_via_link("cat", &link.token, link.expires_at).unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        let link = s.create_invite_link("ann", &g.id, NOW).unwrap();
        s.delete_group("ann", &g.id).unwrap();
        // deleting a group drops its links
        let err = s.join_group_via_link("cat", &link.token, NOW).unwrap_err();
        assert_eq!(err.to_string(), "Invalid invite link");
    }

    #[test]
    fn only_creator_removes_members() {
        let s = store();
        let g = squad(&s);
        let err = s.remove_member("ben", &g.id, "ann").unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let err = s.remove_member("ann", &g.id, "ann").unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        s.remove_member("ann", &g.id, "ben").unwrap();
        assert!(!s.get_group(&g.id).unwrap().is_member("ben"));
        assert!(s.user_groups("ben").is_empty());
    }

    #[test]
    fn creator_exit_hands_over_ownership() {
        let s = store();
        let g = squad(&s);
        let outcome = s.exit_group("ann", &g.id).unwrap();
        assert_eq!(outcome, ExitOutcome::Left { new_owner: Some("ben".into()) });
        assert_eq!(s.get_group(&g.id).unwrap().created_by, "ben");

        let outcome = s.exit_group("ben", &g.id).unwrap();
        assert_eq!(outcome, ExitOutcome::Deleted);
        assert!(matches!(s.get_group(&g.id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn delete_group_requires_creator_and_cleans_up() {
        let s = store();
        let g = squad(&s);
        s.create_ping("ben", &g.id, None, NOW).unwrap();
        assert!(matches!(s.delete_group("ben", &g.id), Err(AppError::Forbidden(_))));

        s.delete_group("ann", &g.id).unwrap();
        assert!(s.user_groups("ann").is_empty());
        assert!(s.user_groups("ben").is_empty());
        assert!(!s.has_active_pings(&g.id, NOW));
    }

    #[test]
    fn create_ping_counts_creator_in() {
        let s = store();
        let g = squad(&s);
        let ping = s.create_ping("ben", &g.id, Some(NOW + 10 * MINUTE_MS), NOW).unwrap();
        assert_eq!(ping.expires_at, NOW + 70 * MINUTE_MS);
        assert_eq!(ping.response_of("ben"), Some(&PingResponse::eta(0, NOW)));
        assert_eq!(s.get_group(&g.id).unwrap().last_ping, Some(NOW));

        let err = s.create_ping("zed", &g.id, None, NOW).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let err = s.create_ping("ann", &g.id, Some(NOW - 60 * MINUTE_MS), NOW).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn create_ping_bounds_the_schedule() {
        let s = store();
        let g = squad(&s);

        for at in [i64::MAX, NOW + 25 * HOUR_MS] {
            let err = s.create_ping("ann", &g.id, Some(at), NOW).unwrap_err();
            assert!(matches!(err, AppError::InvalidInput(_)), "accepted {}", at);
        }
        let err = s.create_ping("ann", &g.id, Some(i64::MIN), NOW).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(!s.has_active_pings(&g.id, NOW));

        let ping = s.create_ping("ann", &g.id, Some(NOW + 24 * HOUR_MS), NOW).unwrap();
        assert_eq!(ping.expires_at, NOW + 24 * HOUR_MS + 60 * MINUTE_MS);
    }

    #[test]
    fn expired_invite_links_are_dropped() {
        let s = store();
        let g = squad(&s);
        for _ in 0..100 {
            s.create_invite_link("ann", &g.id, NOW).unwrap();
        }
        assert_eq!(s.invite_links.len(), 100);

        let year_later = NOW + 365 * 24 * HOUR_MS;
        assert_eq!(s.prune_invite_links(year_later), 100);
        assert!(s.invite_links.is_empty());

        // creating a link sweeps the stale ones too
        s.create_invite_link("ann", &g.id, NOW).unwrap();
        let fresh = s.create_invite_link("ann", &g.id, year_later).unwrap();
        assert_eq!(s.invite_links.len(), 1);
        assert!(s.invite_preview(&fresh.token, year_later).is_ok());
    }

    #[test]
    fn concurrent_registrations_cannot_share_a_phone() {
        let s = store();
        let results: Vec<Result<User>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let s = &s;
                    scope.spawn(move || s.create_user_profile(&format!("user{}", i), "+1555000042", None, NOW))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<&User> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AppError::Conflict(_))));
        assert_eq!(
            s.phone_to_uid.get("+1555000042").map(|uid| uid.clone()),
            Some(winners[0].id.clone())
        );
    }

    #[test]
    fn changing_phone_releases_the_old_number() {
        let s = store();
        s.create_user_profile("ann", "+1555000001", None, NOW).unwrap();
        s.create_user_profile("ann", "+1555000009", None, NOW).unwrap();
        s.create_user_profile("ben", "+1555000001", None, NOW).unwrap();
        assert!(matches!(
            s.create_user_profile("ben", "+1555000009", None, NOW),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn responses_and_expiry() {
        let s = store();
        let g = squad(&s);
        let ping = s.create_ping("ann", &g.id, None, NOW).unwrap();

        s.respond_eta("ben", &g.id, &ping.id, 15, NOW + 1).unwrap();
        let p = s.respond_next_round("ben", &g.id, &ping.id, NOW + 2).unwrap();
        assert_eq!(p.response_of("ben"), Some(&PingResponse::next_round(NOW + 2)));
        let p = s.respond_not_today("ben", &g.id, &ping.id, NOW + 3).unwrap();
        assert_eq!(p.response_of("ben").map(|r| r.status), Some(ResponseStatus::Declined));

        assert!(matches!(
            s.respond_eta("ben", &g.id, &ping.id, 61, NOW),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            s.respond_eta("ben", &g.id, "missing", 5, NOW),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            s.respond_eta("ben", &g.id, &ping.id, 5, ping.expires_at),
            Err(AppError::Expired(_))
        ));
    }

    #[test]
    fn active_pings_newest_first_and_prune() {
        let s = store();
        let g = squad(&s);
        let old = s.create_ping("ann", &g.id, None, NOW).unwrap();
        let new = s.create_ping("ben", &g.id, None, NOW + 30 * MINUTE_MS).unwrap();

        let ids: Vec<String> = s.active_pings(&g.id, NOW + 31 * MINUTE_MS).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![new.id.clone(), old.id.clone()]);

        let removed = s.prune_expired(&g.id, old.expires_at);
        assert_eq!(removed, vec![old.id]);
        assert!(s.has_active_pings(&g.id, old.expires_at));

        s.prune_expired(&g.id, new.expires_at);
        assert!(!s.has_active_pings(&g.id, new.expires_at));
    }

    #[test]
    fn group_view_renders_for_viewer() {
        let s = store();
        let g = squad(&s);
        let ping = s.create_ping("ann", &g.id, Some(NOW + 10 * MINUTE_MS), NOW).unwrap();
        s.respond_eta("ben", &g.id, &ping.id, 5, NOW).unwrap();
        s.report_game_status("ben", true, Some(12), Some("ARAM".into()), NOW).unwrap();

        let view = s
            .group_view(&g.id, Viewer { user_id: Some("ben"), offset_minutes: 0 }, NOW)
            .unwrap();
        assert_eq!(view.members.len(), 2);
        assert!(view.members[0].is_creator);
        assert_eq!(view.members[1].game_status.as_ref().map(|st| st.in_game), Some(true));

        let summary = &view.pings[0];
        assert_eq!(summary.headline, "Ann start playing at 7:10 PM");
        assert_eq!(summary.buckets[1].names, vec!["Ben"]);
        assert_eq!(summary.selection_title, "Change start time");
    }

    #[test]
    fn profile_updates() {
        let s = store();
        assert!(matches!(s.set_display_name("ann", "Ann"), Err(AppError::NotFound(_))));
        s.create_user_profile("ann", "+1555000001", None, NOW).unwrap();

        let user = s.link_riot_account("ann", "Ann#EUW", "euw1").unwrap();
        assert_eq!(user.riot_account.unwrap().region, Region::Euw1);
        assert!(s.link_riot_account("ann", "Ann", "EUW1").is_err());

        let user = s.report_game_status("ann", false, Some(3), Some("ARAM".into()), NOW).unwrap();
        let status = user.game_status.unwrap();
        assert!(status.elapsed_minutes.is_none() && status.game_mode.is_none());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("gametime.json");

        let s = store();
        let g = squad(&s);
        s.create_ping("ann", &g.id, None, NOW).unwrap();
        s.invite_member_by_phone("ann", &g.id, "+1555000003").unwrap();
        s.save_snapshot(&path).unwrap();

        let restored = store();
        restored.load_snapshot(&path).unwrap();
        let mut expected = g.clone();
        expected.last_ping = Some(NOW);
        assert_eq!(restored.get_group(&g.id).unwrap(), expected);
        assert_eq!(restored.active_pings(&g.id, NOW).unwrap().len(), 1);
        assert!(matches!(
            restored.create_user_profile("zed", "+1555000001", None, NOW),
            Err(AppError::Conflict(_))
        ));
        restored.create_user_profile("cat", "+1555000003", None, NOW).unwrap();
        assert!(restored.get_group(&g.id).unwrap().is_member("cat"));
    }

    #[test]
    fn missing_snapshot_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let s = store();
        s.load_snapshot(&dir.path().join("absent.json")).unwrap();
        assert!(s.user_groups("ann").is_empty());
    }
}
