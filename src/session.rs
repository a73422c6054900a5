//! Multiplayer session documents and change classification.
//!
//! A [`MultiplayerSession`] wraps the session document returned by the
//! session directory together with its identity, ETag and a set of staged
//! local changes. Setters never touch the server-confirmed document; they
//! record what the next write should change.
//!
//! [`compare_multiplayer_sessions`] classifies which facets differ between two
//! snapshots of the same session.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Result, RtaError};

// ── Change types ────────────────────────────────────────────────────

/// Bit set of session facets that differ between two snapshots, also used
/// to choose which changes a member is shoulder-tapped for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionChangeTypes(u32);

impl SessionChangeTypes {
    pub const NONE: Self = Self(0);
    pub const EVERYTHING: Self = Self(1 << 0);
    pub const HOST_DEVICE_TOKEN_CHANGE: Self = Self(1 << 1);
    pub const INITIALIZATION_STATE_CHANGE: Self = Self(1 << 2);
    pub const MATCHMAKING_STATUS_CHANGE: Self = Self(1 << 3);
    pub const MEMBER_LIST_CHANGE: Self = Self(1 << 4);
    pub const MEMBER_STATUS_CHANGE: Self = Self(1 << 5);
    pub const SESSION_JOINABILITY_CHANGE: Self = Self(1 << 6);
    pub const CUSTOM_PROPERTY_CHANGE: Self = Self(1 << 7);
    pub const MEMBER_CUSTOM_PROPERTY_CHANGE: Self = Self(1 << 8);
    pub const TOURNAMENT_PROPERTY_CHANGE: Self = Self(1 << 9);
    pub const ARBITRATION_PROPERTY_CHANGE: Self = Self(1 << 10);

    const WIRE_NAMES: [(Self, &'static str); 11] = [
        (Self::EVERYTHING, "everything"),
        (Self::HOST_DEVICE_TOKEN_CHANGE, "host"),
        (Self::INITIALIZATION_STATE_CHANGE, "initialization"),
        (Self::MATCHMAKING_STATUS_CHANGE, "matchmakingStatus"),
        (Self::MEMBER_LIST_CHANGE, "membersList"),
        (Self::MEMBER_STATUS_CHANGE, "membersStatus"),
        (Self::SESSION_JOINABILITY_CHANGE, "joinability"),
        (Self::CUSTOM_PROPERTY_CHANGE, "customProperty"),
        (Self::MEMBER_CUSTOM_PROPERTY_CHANGE, "membersCustomProperty"),
        (Self::TOURNAMENT_PROPERTY_CHANGE, "tournaments"),
        (Self::ARBITRATION_PROPERTY_CHANGE, "arbitration"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names used in a member's `subscription.changeTypes` list.
    pub fn wire_names(self) -> Vec<&'static str> {
        Self::WIRE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    fn set_if(&mut self, flag: Self, condition: bool) {
        if condition {
            *self |= flag;
        }
    }
}

impl BitOr for SessionChangeTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SessionChangeTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for SessionChangeTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.wire_names().join("|"))
    }
}

// ── Identity ────────────────────────────────────────────────────────

/// Identity of a session: service configuration, template and name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplayerSessionReference {
    pub scid: String,
    pub template_name: String,
    pub name: String,
}

impl MultiplayerSessionReference {
    pub fn new(
        scid: impl Into<String>,
        template_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            scid: scid.into(),
            template_name: template_name.into(),
            name: name.into(),
        }
    }

    /// A reference with a freshly generated session name.
    pub fn with_generated_name(scid: impl Into<String>, template_name: impl Into<String>) -> Self {
        Self::new(scid, template_name, Uuid::new_v4().to_string())
    }

    /// Parse the `scid~template~name` form used in shoulder taps.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] unless there are exactly three non-empty
    /// parts.
    pub fn from_tap_resource(resource: &str) -> Result<Self> {
        let parts: Vec<&str> = resource.split('~').collect();
        match parts.as_slice() {
            [scid, template, name]
                if !scid.is_empty() && !template.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(*scid, *template, *name))
            }
            _ => Err(RtaError::invalid_argument(format!(
                "malformed session resource: {resource}"
            ))),
        }
    }

    /// Whether every part is non-empty.
    pub fn is_valid(&self) -> bool {
        !self.scid.is_empty() && !self.template_name.is_empty() && !self.name.is_empty()
    }

    /// Path of the session under the session directory endpoint.
    pub fn uri_path(&self) -> String {
        format!(
            "/serviceconfigs/{}/sessionTemplates/{}/sessions/{}",
            self.scid, self.template_name, self.name
        )
    }

    /// Case-insensitive identity comparison.
    pub fn matches(&self, other: &Self) -> bool {
        self.scid.eq_ignore_ascii_case(&other.scid)
            && self.template_name.eq_ignore_ascii_case(&other.template_name)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl fmt::Display for MultiplayerSessionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}~{}", self.scid, self.template_name, self.name)
    }
}

// ── Document model ──────────────────────────────────────────────────

/// Where a member stands in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    Reserved,
    Inactive,
    Ready,
    Active,
}

/// Stage of managed initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitializationStage {
    None,
    Joining,
    Measuring,
    Evaluating,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInitialization {
    #[serde(default)]
    pub stage: InitializationStage,
    #[serde(default)]
    pub episode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConstants {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_members_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Facet fixed at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConstants {
    #[serde(default)]
    pub system: SystemConstants,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProperties {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Host device token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_restriction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_restriction: Option<String>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turn: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matchmaking: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Mutable session facet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionProperties {
    #[serde(default)]
    pub system: SystemProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberSystemConstants {
    #[serde(default)]
    pub xuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize: Option<bool>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberConstants {
    #[serde(default)]
    pub system: MemberSystemConstants,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberSystemProperties {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ready: bool,
    /// Real-time activity connection id the member is tapped on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberProperties {
    #[serde(default)]
    pub system: MemberSystemProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// One member of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiplayerSessionMember {
    #[serde(default)]
    pub constants: MemberConstants,
    #[serde(default)]
    pub properties: MemberProperties,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reserved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamertag: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl MultiplayerSessionMember {
    pub fn xuid(&self) -> &str {
        &self.constants.system.xuid
    }

    pub fn status(&self) -> MemberStatus {
        let system = &self.properties.system;
        if self.reserved {
            MemberStatus::Reserved
        } else if system.active {
            MemberStatus::Active
        } else if system.ready {
            MemberStatus::Ready
        } else {
            MemberStatus::Inactive
        }
    }

    pub fn custom_properties(&self) -> Option<&Value> {
        non_null(self.properties.custom.as_ref())
    }
}

/// `servers.matchmaking.properties.system`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typical_wait: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_session_ref: Option<MultiplayerSessionReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionServers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matchmaking: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tournaments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbitration: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersInfo {
    #[serde(default)]
    pub first: u32,
    #[serde(default)]
    pub next: u32,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub accepted: u32,
}

/// Session document body as exchanged with the session directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    #[serde(default)]
    pub constants: SessionConstants,
    #[serde(default)]
    pub properties: SessionProperties,
    /// Members keyed by their (sparse) index.
    #[serde(default)]
    pub members: BTreeMap<u32, MultiplayerSessionMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_types: Option<Value>,
    #[serde(default)]
    pub servers: SessionServers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializing: Option<SessionInitialization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_info: Option<MembersInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub change_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

// ── Staged changes ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct StagedMember {
    initialize: Option<bool>,
    custom_constants: Option<Value>,
    active: Option<bool>,
    custom_properties: Map<String, Value>,
    subscription: Option<SessionChangeTypes>,
}

#[derive(Debug, Clone, Default)]
struct StagedChanges {
    write_constants: bool,
    host: Option<String>,
    closed: Option<bool>,
    locked: Option<bool>,
    join_restriction: Option<String>,
    keywords: Option<Vec<String>>,
    turn: Option<Vec<u32>>,
    /// `Null` values delete the property.
    custom_properties: Map<String, Value>,
    me: Option<StagedMember>,
    leave: bool,
    reservations: Vec<(String, Option<Value>)>,
}

impl StagedChanges {
    fn is_empty(&self) -> bool {
        !self.write_constants
            && self.host.is_none()
            && self.closed.is_none()
            && self.locked.is_none()
            && self.join_restriction.is_none()
            && self.keywords.is_none()
            && self.turn.is_none()
            && self.custom_properties.is_empty()
            && self.me.is_none()
            && !self.leave
            && self.reservations.is_empty()
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// One multiplayer session: server-confirmed document plus staged changes.
#[derive(Debug, Clone)]
pub struct MultiplayerSession {
    reference: MultiplayerSessionReference,
    document: SessionDocument,
    etag: Option<String>,
    current_user_xuid: Option<String>,
    subscription_id: Uuid,
    staged: StagedChanges,
}

impl MultiplayerSession {
    /// A new, never-written session owned by `current_user_xuid`.
    pub fn new(current_user_xuid: impl Into<String>, reference: MultiplayerSessionReference) -> Self {
        Self {
            reference,
            document: SessionDocument::default(),
            etag: None,
            current_user_xuid: Some(current_user_xuid.into()),
            subscription_id: Uuid::new_v4(),
            staged: StagedChanges::default(),
        }
    }

    /// Set the member cap for a session that has not been written yet.
    #[must_use]
    pub fn with_max_members(mut self, max_members: u32) -> Self {
        self.document.constants.system.max_members_count = Some(max_members);
        self.staged.write_constants = true;
        self
    }

    /// Set the visibility for a session that has not been written yet.
    #[must_use]
    pub fn with_visibility(mut self, visibility: impl Into<String>) -> Self {
        self.document.constants.system.visibility = Some(visibility.into());
        self.staged.write_constants = true;
        self
    }

    /// Wrap an already parsed document.
    pub fn from_document(reference: MultiplayerSessionReference, document: SessionDocument) -> Self {
        Self {
            reference,
            document,
            etag: None,
            current_user_xuid: None,
            subscription_id: Uuid::new_v4(),
            staged: StagedChanges::default(),
        }
    }

    /// Parse a session from a JSON value.
    ///
    /// # Errors
    ///
    /// [`RtaError::Serialization`] if the value is not a session document.
    pub fn from_json(reference: MultiplayerSessionReference, value: Value) -> Result<Self> {
        let document: SessionDocument = serde_json::from_value(value)?;
        Ok(Self::from_document(reference, document))
    }

    /// Parse a session from an HTTP response body.
    ///
    /// # Errors
    ///
    /// [`RtaError::Serialization`] if the body is not a session document.
    pub fn from_response(
        reference: MultiplayerSessionReference,
        body: &[u8],
        etag: Option<String>,
        current_user_xuid: Option<String>,
    ) -> Result<Self> {
        let document: SessionDocument = serde_json::from_slice(body)?;
        let mut session = Self::from_document(reference, document);
        session.etag = etag;
        session.current_user_xuid = current_user_xuid;
        Ok(session)
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn reference(&self) -> &MultiplayerSessionReference {
        &self.reference
    }

    pub fn document(&self) -> &SessionDocument {
        &self.document
    }

    pub fn change_number(&self) -> u64 {
        self.document.change_number
    }

    pub fn branch(&self) -> Option<&str> {
        self.document.branch.as_deref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn members(&self) -> impl Iterator<Item = (u32, &MultiplayerSessionMember)> {
        self.document.members.iter().map(|(index, member)| (*index, member))
    }

    pub fn member(&self, index: u32) -> Option<&MultiplayerSessionMember> {
        self.document.members.get(&index)
    }

    /// The member whose xuid matches the signed-in user, if present.
    pub fn current_user(&self) -> Option<&MultiplayerSessionMember> {
        let xuid = self.current_user_xuid.as_deref()?;
        self.document
            .members
            .values()
            .find(|m| m.xuid().eq_ignore_ascii_case(xuid))
    }

    pub fn host_device_token(&self) -> Option<&str> {
        self.document.properties.system.host.as_deref()
    }

    pub fn closed(&self) -> bool {
        self.document.properties.system.closed
    }

    pub fn locked(&self) -> bool {
        self.document.properties.system.locked
    }

    pub fn join_restriction(&self) -> Option<&str> {
        self.document.properties.system.join_restriction.as_deref()
    }

    pub fn max_members(&self) -> Option<u32> {
        self.document.constants.system.max_members_count
    }

    pub fn initialization(&self) -> Option<&SessionInitialization> {
        self.document.initializing.as_ref()
    }

    pub fn custom_properties(&self) -> Option<&Value> {
        non_null(self.document.properties.custom.as_ref())
    }

    /// `servers.matchmaking.properties.system`, if present and well formed.
    pub fn matchmaking_server(&self) -> Option<MatchmakingServer> {
        let system = self
            .document
            .servers
            .matchmaking
            .as_ref()?
            .pointer("/properties/system")?;
        serde_json::from_value(system.clone()).ok()
    }

    /// Whether the member count has reached the cap.
    pub fn is_full(&self) -> bool {
        self.max_members()
            .is_some_and(|max| self.document.members.len() == max as usize)
    }

    /// Id the current member's change subscription is registered under.
    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// Whether any local change is waiting to be written.
    pub fn has_pending_changes(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Whether a staged change needs the caller's real-time activity
    /// connection id.
    pub fn needs_connection_id(&self) -> bool {
        self.staged
            .me
            .as_ref()
            .is_some_and(|me| me.subscription.is_some())
    }

    // ── Staged session mutations ────────────────────────────────────

    pub fn set_host_device_token(&mut self, token: impl Into<String>) {
        self.staged.host = Some(token.into());
    }

    pub fn set_closed(&mut self, closed: bool) {
        self.staged.closed = Some(closed);
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.staged.locked = Some(locked);
    }

    pub fn set_join_restriction(&mut self, restriction: impl Into<String>) {
        self.staged.join_restriction = Some(restriction.into());
    }

    pub fn set_keywords(&mut self, keywords: Vec<String>) {
        self.staged.keywords = Some(keywords);
    }

    pub fn set_turn(&mut self, turn: Vec<u32>) {
        self.staged.turn = Some(turn);
    }

    /// Stage a session custom property.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] if `name` is empty.
    pub fn set_session_custom_property_json(&mut self, name: &str, value: Value) -> Result<()> {
        if name.is_empty() {
            return Err(RtaError::invalid_argument("property name must not be empty"));
        }
        self.staged.custom_properties.insert(name.to_owned(), value);
        Ok(())
    }

    /// Stage removal of a session custom property.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] if `name` is empty.
    pub fn delete_session_custom_property_json(&mut self, name: &str) -> Result<()> {
        self.set_session_custom_property_json(name, Value::Null)
    }

    /// Reserve a seat for another user.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] if `xuid` is empty.
    pub fn add_member_reservation(&mut self, xuid: &str, custom_constants: Option<Value>) -> Result<()> {
        if xuid.is_empty() {
            return Err(RtaError::invalid_argument("xuid must not be empty"));
        }
        self.staged
            .reservations
            .push((xuid.to_owned(), custom_constants));
        Ok(())
    }

    // ── Staged current-member mutations ─────────────────────────────

    /// Stage the current user joining the session as active.
    ///
    /// # Errors
    ///
    /// [`RtaError::Runtime`] if the session has no current user.
    pub fn join(&mut self, custom_constants: Option<Value>, initialize: bool) -> Result<()> {
        self.require_current_user()?;
        self.staged.leave = false;
        let me = self.staged.me.get_or_insert_with(StagedMember::default);
        me.custom_constants = custom_constants;
        me.initialize = initialize.then_some(true);
        me.active = Some(true);
        Ok(())
    }

    /// Stage the current user leaving. Discards other staged member changes.
    ///
    /// # Errors
    ///
    /// [`RtaError::Runtime`] if the session has no current user.
    pub fn leave(&mut self) -> Result<()> {
        self.require_current_user()?;
        self.staged.me = None;
        self.staged.leave = true;
        Ok(())
    }

    /// Stage the current user's status. Only `Active` and `Inactive` can be
    /// written.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] for `Reserved` or `Ready`.
    /// - [`RtaError::Runtime`] if the session has no current user.
    pub fn set_current_user_status(&mut self, status: MemberStatus) -> Result<()> {
        let active = match status {
            MemberStatus::Active => true,
            MemberStatus::Inactive => false,
            MemberStatus::Reserved | MemberStatus::Ready => {
                return Err(RtaError::invalid_argument(
                    "only active and inactive can be written",
                ))
            }
        };
        self.current_member_mut()?.active = Some(active);
        Ok(())
    }

    /// Stage a custom property on the current member.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] if `name` is empty.
    /// - [`RtaError::Runtime`] if the session has no current user.
    pub fn set_current_user_member_custom_property_json(
        &mut self,
        name: &str,
        value: Value,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(RtaError::invalid_argument("property name must not be empty"));
        }
        self.current_member_mut()?
            .custom_properties
            .insert(name.to_owned(), value);
        Ok(())
    }

    /// Stage removal of a custom property on the current member.
    ///
    /// # Errors
    ///
    /// Same as [`set_current_user_member_custom_property_json`](Self::set_current_user_member_custom_property_json).
    pub fn delete_current_user_member_custom_property_json(&mut self, name: &str) -> Result<()> {
        self.set_current_user_member_custom_property_json(name, Value::Null)
    }

    /// Ask the service to shoulder-tap the current member when any of
    /// `change_types` changes. The write carrying this needs the real-time
    /// activity connection id.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] if `change_types` is empty.
    /// - [`RtaError::Runtime`] if the session has no current user.
    pub fn set_session_change_subscription(&mut self, change_types: SessionChangeTypes) -> Result<()> {
        if change_types.is_empty() {
            return Err(RtaError::invalid_argument("change types must not be empty"));
        }
        self.current_member_mut()?.subscription = Some(change_types);
        Ok(())
    }

    fn require_current_user(&self) -> Result<&str> {
        self.current_user_xuid
            .as_deref()
            .filter(|xuid| !xuid.is_empty())
            .ok_or_else(|| RtaError::Runtime("session has no current user".into()))
    }

    fn current_member_mut(&mut self) -> Result<&mut StagedMember> {
        self.require_current_user()?;
        Ok(self.staged.me.get_or_insert_with(StagedMember::default))
    }

    // ── Write request ───────────────────────────────────────────────

    /// Build the JSON body for writing the staged changes.
    ///
    /// # Errors
    ///
    /// [`RtaError::Runtime`] if a staged change subscription needs
    /// `rta_connection_id` and none was supplied.
    pub fn write_request_body(&self, rta_connection_id: Option<&str>) -> Result<Value> {
        let staged = &self.staged;
        let mut body = Map::new();

        if staged.write_constants {
            body.insert(
                "constants".into(),
                serde_json::to_value(&self.document.constants)?,
            );
        }

        let mut system = Map::new();
        if let Some(host) = &staged.host {
            system.insert("host".into(), json!(host));
        }
        if let Some(closed) = staged.closed {
            system.insert("closed".into(), json!(closed));
        }
        if let Some(locked) = staged.locked {
            system.insert("locked".into(), json!(locked));
        }
        if let Some(restriction) = &staged.join_restriction {
            system.insert("joinRestriction".into(), json!(restriction));
        }
        if let Some(keywords) = &staged.keywords {
            system.insert("keywords".into(), json!(keywords));
        }
        if let Some(turn) = &staged.turn {
            system.insert("turn".into(), json!(turn));
        }
        let mut properties = Map::new();
        if !system.is_empty() {
            properties.insert("system".into(), Value::Object(system));
        }
        if !staged.custom_properties.is_empty() {
            properties.insert(
                "custom".into(),
                Value::Object(staged.custom_properties.clone()),
            );
        }
        if !properties.is_empty() {
            body.insert("properties".into(), Value::Object(properties));
        }

        let mut members = Map::new();
        if staged.leave {
            members.insert("me".into(), Value::Null);
        } else if let Some(me) = &staged.me {
            members.insert("me".into(), self.member_request(me, rta_connection_id)?);
        }
        for (n, (xuid, custom_constants)) in staged.reservations.iter().enumerate() {
            let mut constants = Map::new();
            constants.insert("system".into(), json!({ "xuid": xuid }));
            if let Some(custom) = custom_constants {
                constants.insert("custom".into(), custom.clone());
            }
            members.insert(format!("reserve_{n}"), json!({ "constants": constants }));
        }
        if !members.is_empty() {
            body.insert("members".into(), Value::Object(members));
        }

        Ok(Value::Object(body))
    }

    fn member_request(&self, me: &StagedMember, rta_connection_id: Option<&str>) -> Result<Value> {
        let xuid = self.require_current_user()?;
        let mut member = Map::new();

        let mut constants_system = Map::new();
        constants_system.insert("xuid".into(), json!(xuid));
        if let Some(initialize) = me.initialize {
            constants_system.insert("initialize".into(), json!(initialize));
        }
        let mut constants = Map::new();
        constants.insert("system".into(), Value::Object(constants_system));
        if let Some(custom) = &me.custom_constants {
            constants.insert("custom".into(), custom.clone());
        }
        member.insert("constants".into(), Value::Object(constants));

        let mut system = Map::new();
        if let Some(active) = me.active {
            system.insert("active".into(), json!(active));
            if active {
                system.insert("ready".into(), json!(true));
            }
        }
        if let Some(change_types) = me.subscription {
            let connection_id = rta_connection_id.filter(|id| !id.is_empty()).ok_or_else(|| {
                RtaError::Runtime(
                    "session change subscription requires an established real-time activity connection"
                        .into(),
                )
            })?;
            system.insert("connection".into(), json!(connection_id));
            system.insert(
                "subscription".into(),
                json!({
                    "id": self.subscription_id.to_string().to_uppercase(),
                    "changeTypes": change_types.wire_names(),
                }),
            );
        }
        let mut properties = Map::new();
        if !system.is_empty() {
            properties.insert("system".into(), Value::Object(system));
        }
        if !me.custom_properties.is_empty() {
            properties.insert("custom".into(), Value::Object(me.custom_properties.clone()));
        }
        if !properties.is_empty() {
            member.insert("properties".into(), Value::Object(properties));
        }
        Ok(Value::Object(member))
    }

    /// Drop every staged change.
    pub fn clear_pending_changes(&mut self) {
        self.staged = StagedChanges::default();
    }

    /// Compare against an older snapshot of the same session.
    ///
    /// # Errors
    ///
    /// See [`compare_multiplayer_sessions`].
    pub fn compare(&self, old: &MultiplayerSession) -> Result<SessionChangeTypes> {
        compare_multiplayer_sessions(self, old)
    }
}

// ── Compare ─────────────────────────────────────────────────────────

/// Classify which facets differ between two snapshots of one session.
///
/// Symmetric: swapping the arguments yields the same result. A facet absent
/// (or `null`) on both sides is equal; present on one side only is a change.
/// JSON facets compare structurally, so key order and whitespace never count.
///
/// # Errors
///
/// [`RtaError::InvalidArgument`] if the sessions have different identities.
pub fn compare_multiplayer_sessions(
    current: &MultiplayerSession,
    old: &MultiplayerSession,
) -> Result<SessionChangeTypes> {
    if !current.reference.matches(&old.reference) {
        return Err(RtaError::invalid_argument(format!(
            "cannot compare session {} with session {}",
            current.reference, old.reference
        )));
    }

    let mut changes = SessionChangeTypes::NONE;
    let (a, b) = (&current.document, &old.document);

    let members_a = members_by_xuid(a);
    let members_b = members_by_xuid(b);
    let indices_a: BTreeSet<u32> = a.members.keys().copied().collect();
    let indices_b: BTreeSet<u32> = b.members.keys().copied().collect();
    changes.set_if(
        SessionChangeTypes::MEMBER_LIST_CHANGE,
        a.members.len() != b.members.len()
            || indices_a != indices_b
            || members_a.keys().ne(members_b.keys()),
    );

    for (xuid, member_a) in &members_a {
        let Some(member_b) = members_b.get(xuid) else {
            continue;
        };
        changes.set_if(
            SessionChangeTypes::MEMBER_STATUS_CHANGE,
            member_a.status() != member_b.status(),
        );
        changes.set_if(
            SessionChangeTypes::MEMBER_CUSTOM_PROPERTY_CHANGE,
            member_a.custom_properties() != member_b.custom_properties(),
        );
    }

    changes.set_if(
        SessionChangeTypes::HOST_DEVICE_TOKEN_CHANGE,
        !eq_ignore_case(current.host_device_token(), old.host_device_token()),
    );

    changes.set_if(
        SessionChangeTypes::INITIALIZATION_STATE_CHANGE,
        current.initialization() != old.initialization(),
    );

    changes.set_if(
        SessionChangeTypes::MATCHMAKING_STATUS_CHANGE,
        matchmaking_differs(
            current.matchmaking_server().as_ref(),
            old.matchmaking_server().as_ref(),
        ),
    );

    changes.set_if(
        SessionChangeTypes::SESSION_JOINABILITY_CHANGE,
        current.closed() != old.closed()
            || current.locked() != old.locked()
            || current.join_restriction() != old.join_restriction()
            || current.is_full() != old.is_full(),
    );

    changes.set_if(
        SessionChangeTypes::CUSTOM_PROPERTY_CHANGE,
        current.custom_properties() != old.custom_properties(),
    );

    changes.set_if(
        SessionChangeTypes::TOURNAMENT_PROPERTY_CHANGE,
        non_null(a.servers.tournaments.as_ref()) != non_null(b.servers.tournaments.as_ref()),
    );
    changes.set_if(
        SessionChangeTypes::ARBITRATION_PROPERTY_CHANGE,
        non_null(a.servers.arbitration.as_ref()) != non_null(b.servers.arbitration.as_ref()),
    );

    Ok(changes)
}

/// Members keyed by lowercased xuid. A member with no xuid, or one whose
/// xuid is already taken, is keyed by its index instead so none are lost.
fn members_by_xuid(document: &SessionDocument) -> BTreeMap<String, &MultiplayerSessionMember> {
    let mut members = BTreeMap::new();
    for (index, member) in &document.members {
        let xuid = member.xuid().to_ascii_lowercase();
        let key = if xuid.is_empty() || members.contains_key(&xuid) {
            format!("#{index}")
        } else {
            xuid
        };
        members.insert(key, member);
    }
    members
}

fn matchmaking_differs(a: Option<&MatchmakingServer>, b: Option<&MatchmakingServer>) -> bool {
    match (a, b) {
        (None, None) => false,
        (Some(a), Some(b)) => {
            let targets_differ = match (&a.target_session_ref, &b.target_session_ref) {
                (None, None) => false,
                (Some(x), Some(y)) => !x.matches(y),
                _ => true,
            };
            a.status != b.status || a.ticket != b.ticket || targets_differ
        }
        _ => true,
    }
}

fn eq_ignore_case(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn reference() -> MultiplayerSessionReference {
        MultiplayerSessionReference::new("scid", "lobby", "session-1")
    }

    fn session(value: Value) -> MultiplayerSession {
        MultiplayerSession::from_json(reference(), value).unwrap()
    }

    #[test]
    fn change_types_compose() {
        let types = SessionChangeTypes::HOST_DEVICE_TOKEN_CHANGE | SessionChangeTypes::MEMBER_LIST_CHANGE;
        assert!(types.contains(SessionChangeTypes::MEMBER_LIST_CHANGE));
        assert!(!types.contains(SessionChangeTypes::EVERYTHING));
        assert_eq!(types.bits(), 0x12);
        assert_eq!(types.wire_names(), vec!["host", "membersList"]);
        assert_eq!(SessionChangeTypes::NONE.to_string(), "none");
    }

    #[test]
    fn reference_from_tap_resource() {
        let parsed = MultiplayerSessionReference::from_tap_resource("scid~lobby~session-1").unwrap();
        assert_eq!(parsed, reference());
        assert!(MultiplayerSessionReference::from_tap_resource("scid~lobby").is_err());
        assert!(MultiplayerSessionReference::from_tap_resource("scid~~name").is_err());
        assert_eq!(parsed.to_string(), "scid~lobby~session-1");
    }

    #[test]
    fn generated_names_are_unique() {
        let a = MultiplayerSessionReference::with_generated_name("scid", "lobby");
        let b = MultiplayerSessionReference::with_generated_name("scid", "lobby");
        assert!(a.is_valid());
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn member_status_derivation() {
        let s = session(json!({
            "members": {
                "0": {"constants": {"system": {"xuid": "1"}}, "properties": {"system": {"active": true}}},
                "1": {"constants": {"system": {"xuid": "2"}}, "properties": {"system": {"ready": true}}},
                "3": {"constants": {"system": {"xuid": "3"}}, "reserved": true},
                "4": {"constants": {"system": {"xuid": "4"}}}
            }
        }));
        let statuses: Vec<_> = s.members().map(|(_, m)| m.status()).collect();
        assert_eq!(
            statuses,
            vec![
                MemberStatus::Active,
                MemberStatus::Ready,
                MemberStatus::Reserved,
                MemberStatus::Inactive
            ]
        );
        assert!(s.member(2).is_none());
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let value = json!({
            "properties": {"system": {"host": "A", "turnTimeout": 30}},
            "servers": {"relay": {"x": 1}},
            "changeNumber": 4
        });
        let s = session(value);
        let back = serde_json::to_value(s.document()).unwrap();
        assert_eq!(back["properties"]["system"]["turnTimeout"], json!(30));
        assert_eq!(back["servers"]["relay"], json!({"x": 1}));
        assert_eq!(s.change_number(), 4);
    }

    #[test]
    fn matchmaking_server_is_read_from_servers() {
        let s = session(json!({
            "servers": {"matchmaking": {"properties": {"system": {
                "status": "searching",
                "targetSessionRef": {"scid": "scid", "templateName": "game", "name": "g1"}
            }}}}
        }));
        let server = s.matchmaking_server().unwrap();
        assert_eq!(server.status.as_deref(), Some("searching"));
        assert_eq!(server.target_session_ref.unwrap().name, "g1");
    }

    #[test]
    fn write_body_contains_only_staged_changes() {
        let mut s = MultiplayerSession::new("100", reference());
        s.set_host_device_token("B");
        s.set_session_custom_property_json("map", json!("dust")).unwrap();
        s.delete_session_custom_property_json("mode").unwrap();
        let body = s.write_request_body(None).unwrap();
        assert_eq!(
            body,
            json!({
                "properties": {
                    "system": {"host": "B"},
                    "custom": {"map": "dust", "mode": null}
                }
            })
        );
    }

    #[test]
    fn join_and_member_properties() {
        let mut s = MultiplayerSession::new("100", reference()).with_max_members(4);
        s.join(Some(json!({"skill": 3})), false).unwrap();
        s.set_current_user_member_custom_property_json("team", json!("red")).unwrap();
        let body = s.write_request_body(None).unwrap();
        assert_eq!(body["constants"]["system"]["maxMembersCount"], json!(4));
        let me = &body["members"]["me"];
        assert_eq!(me["constants"]["system"]["xuid"], json!("100"));
        assert_eq!(me["constants"]["custom"], json!({"skill": 3}));
        assert_eq!(me["properties"]["system"]["active"], json!(true));
        assert_eq!(me["properties"]["custom"]["team"], json!("red"));
    }

    #[test]
    fn leave_writes_null_member() {
        let mut s = MultiplayerSession::new("100", reference());
        s.set_current_user_status(MemberStatus::Active).unwrap();
        s.leave().unwrap();
        assert_eq!(
            s.write_request_body(None).unwrap(),
            json!({"members": {"me": null}})
        );
    }

    #[test]
    fn reservations_are_numbered() {
        let mut s = MultiplayerSession::new("100", reference());
        s.add_member_reservation("200", None).unwrap();
        s.add_member_reservation("300", Some(json!({"slot": 2}))).unwrap();
        let body = s.write_request_body(None).unwrap();
        assert_eq!(body["members"]["reserve_0"]["constants"]["system"]["xuid"], json!("200"));
        assert_eq!(body["members"]["reserve_1"]["constants"]["custom"], json!({"slot": 2}));
    }

    #[test]
    fn unwritable_member_status_is_rejected() {
        let mut s = MultiplayerSession::new("100", reference());
        assert!(matches!(
            s.set_current_user_status(MemberStatus::Reserved),
            Err(RtaError::InvalidArgument(_))
        ));
        assert!(!s.has_pending_changes());
    }

    #[test]
    fn member_mutations_need_a_current_user() {
        let mut s = session(json!({}));
        assert!(matches!(
            s.set_current_user_status(MemberStatus::Active),
            Err(RtaError::Runtime(_))
        ));
    }

    #[test]
    fn change_subscription_needs_connection_id() {
        let mut s = MultiplayerSession::new("100", reference());
        s.set_session_change_subscription(
            SessionChangeTypes::MEMBER_LIST_CHANGE | SessionChangeTypes::HOST_DEVICE_TOKEN_CHANGE,
        )
        .unwrap();
        assert!(s.needs_connection_id());
        assert!(matches!(
            s.write_request_body(None),
            Err(RtaError::Runtime(_))
        ));

        let body = s.write_request_body(Some("conn-1")).unwrap();
        let system = &body["members"]["me"]["properties"]["system"];
        assert_eq!(system["connection"], json!("conn-1"));
        assert_eq!(
            system["subscription"]["changeTypes"],
            json!(["host", "membersList"])
        );
        assert_eq!(
            system["subscription"]["id"],
            json!(s.subscription_id().to_string().to_uppercase())
        );
    }

    #[test]
    fn clear_discards_staged_changes() {
        let mut s = MultiplayerSession::new("100", reference());
        s.set_closed(true);
        assert!(s.has_pending_changes());
        s.clear_pending_changes();
        assert!(!s.has_pending_changes());
        assert_eq!(s.write_request_body(None).unwrap(), json!({}));
    }

    #[test]
    fn unrecognized_initialization_stage_is_unknown() {
        let stage: InitializationStage = serde_json::from_value(json!("warmup")).unwrap();
        assert_eq!(stage, InitializationStage::Unknown);
        let stage: InitializationStage = serde_json::from_value(json!("measuring")).unwrap();
        assert_eq!(stage, InitializationStage::Measuring);
        assert_eq!(InitializationStage::default(), InitializationStage::Unknown);
    }

    #[test]
    fn compare_identical_is_none() {
        let s = session(json!({
            "properties": {"system": {"host": "A"}, "custom": {"a": 1}},
            "members": {"0": {"constants": {"system": {"xuid": "1"}}}}
        }));
        assert_eq!(s.compare(&s).unwrap(), SessionChangeTypes::NONE);
    }

    #[test]
    fn compare_rejects_different_sessions() {
        let a = session(json!({}));
        let b = MultiplayerSession::from_json(
            MultiplayerSessionReference::new("scid", "lobby", "other"),
            json!({}),
        )
        .unwrap();
        assert!(matches!(
            compare_multiplayer_sessions(&a, &b),
            Err(RtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn compare_identity_ignores_case() {
        let a = session(json!({}));
        let b = MultiplayerSession::from_json(
            MultiplayerSessionReference::new("SCID", "Lobby", "SESSION-1"),
            json!({}),
        )
        .unwrap();
        assert_eq!(compare_multiplayer_sessions(&a, &b).unwrap(), SessionChangeTypes::NONE);
    }

    #[test]
    fn host_comparison_ignores_case() {
        let a = session(json!({"properties": {"system": {"host": "abc"}}}));
        let b = session(json!({"properties": {"system": {"host": "ABC"}}}));
        assert_eq!(a.compare(&b).unwrap(), SessionChangeTypes::NONE);
    }

    #[test]
    fn joinability_tracks_fullness() {
        let a = session(json!({
            "constants": {"system": {"maxMembersCount": 1}},
            "members": {"0": {"constants": {"system": {"xuid": "1"}}}}
        }));
        let b = session(json!({"constants": {"system": {"maxMembersCount": 1}}}));
        let changes = a.compare(&b).unwrap();
        assert!(changes.contains(SessionChangeTypes::SESSION_JOINABILITY_CHANGE));
        assert!(changes.contains(SessionChangeTypes::MEMBER_LIST_CHANGE));
    }
}
