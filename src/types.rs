use serde::{Deserialize, Serialize};

use crate::aggregate::PingSummary;
use crate::riot::Region;

/// A registered user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub riot_account: Option<RiotAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_status: Option<GameStatus>,
}

/// A linked Riot account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiotAccount {
    pub game_name: String,
    pub tag_line: String,
    pub region: Region,
}

/// Last in-game status a client reported for its user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatus {
    pub in_game: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_mode: Option<String>,
    pub reported_at: i64,
}

/// A named set of members with one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: i64,
    /// Member uids in join order.
    pub members_by_uid: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_game: Option<String>,
}

impl Group {
    pub fn is_member(&self, uid: &str) -> bool {
        self.members_by_uid.iter().any(|m| m == uid)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_ping.unwrap_or(self.created_at).max(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Eta,
    Declined,
    Pending,
}

/// A member's answer to a ping. An `Eta` without minutes means "next round".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub eta_minutes: Option<i64>,
    pub responded_at: i64,
}

impl PingResponse {
    pub fn eta(minutes: i64, now: i64) -> Self {
        Self { status: ResponseStatus::Eta, eta_minutes: Some(minutes), responded_at: now }
    }

    pub fn next_round(now: i64) -> Self {
        Self { status: ResponseStatus::Eta, eta_minutes: None, responded_at: now }
    }

    pub fn declined(now: i64) -> Self {
        Self { status: ResponseStatus::Declined, eta_minutes: None, responded_at: now }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberResponse {
    pub user_id: String,
    #[serde(flatten)]
    pub response: PingResponse,
}

/// A time-boxed invitation to play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub id: String,
    pub group_id: String,
    pub created_by: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<i64>,
    pub expires_at: i64,
    /// Responses in the order members first answered.
    #[serde(default)]
    pub responses: Vec<MemberResponse>,
}

impl Ping {
    /// Scheduled start, or creation time for "play now" pings.
    pub fn base_time(&self) -> i64 {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn response_of(&self, uid: &str) -> Option<&PingResponse> {
        self.responses.iter().find(|r| r.user_id == uid).map(|r| &r.response)
    }

    /// Replaces an existing answer in place, keeping the member's position.
    pub fn set_response(&mut self, uid: &str, response: PingResponse) {
        match self.responses.iter_mut().find(|r| r.user_id == uid) {
            Some(existing) => existing.response = response,
            None => self.responses.push(MemberResponse { user_id: uid.to_string(), response }),
        }
    }
}

/// A shareable join token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteLink {
    pub token: String,
    pub group_id: String,
    pub created_by: String,
    pub expires_at: i64,
}

/// A group entry in the user's group list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListing {
    pub id: String,
    pub name: String,
    pub member_count: usize,
    pub last_ping_label: String,
}

/// A member as shown on a group screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub user_id: String,
    pub name: String,
    pub is_creator: bool,
    pub game_status: Option<GameStatus>,
}

/// Everything a viewer needs to render one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub group: Group,
    pub members: Vec<MemberView>,
    pub pings: Vec<PingSummary>,
}

/// Preview of an invite link before joining.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePreview {
    pub group_id: String,
    pub group_name: String,
    pub member_count: usize,
    pub expires_at: i64,
}

/// Messages sent from server to clients via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    Profile {
        user: User,
    },
    GroupList {
        groups: Vec<GroupListing>,
    },
    GroupCreated {
        group: Group,
    },
    GroupView {
        view: GroupView,
    },
    InviteLink {
        token: String,
        url: String,
        expires_at: i64,
    },
    Joined {
        group_id: String,
        message: String,
    },
    GroupClosed {
        group_id: String,
        message: String,
    },
    SuggestedStart {
        scheduled_at: i64,
        label: String,
        timezone: String,
    },
    ErrorMessage {
        message: String,
    },
}

/// Messages sent from clients to server via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    // Profile
    GetProfile,
    Register { phone_number: String, display_name: Option<String> },
    SetDisplayName { display_name: String },
    LinkRiotAccount { riot_id: String, region: String },
    ReportGameStatus {
        in_game: bool,
        #[serde(default)]
        elapsed_minutes: Option<u32>,
        #[serde(default)]
        game_mode: Option<String>,
    },

    // Groups
    ListGroups,
    CreateGroup {
        name: String,
        #[serde(default)]
        member_ids: Vec<String>,
    },
    OpenGroup { group_id: String },
    CloseGroup,
    InviteByPhone { group_id: String, phone_number: String },
    CreateInviteLink { group_id: String },
    JoinViaLink { token: String },
    RemoveMember { group_id: String, user_id: String },
    ExitGroup { group_id: String },
    DeleteGroup { group_id: String },

    // Pings
    SuggestedStart,
    CreatePing {
        group_id: String,
        #[serde(default)]
        scheduled_at: Option<i64>,
    },
    RespondEta { group_id: String, ping_id: String, minutes: i64 },
    RespondNextRound { group_id: String, ping_id: String },
    RespondNotToday { group_id: String, ping_id: String },
}
