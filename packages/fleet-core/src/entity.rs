//! Replicated entity records.
//!
//! Every entity is stored once in the cluster store as a flat record of
//! string fields (`field key -> encoded value`). Nodes cache decoded copies
//! and keep them current one field at a time, so each entity kind exposes a
//! closed set of field keys plus per-field encode/apply functions.
//!
//! Field encoding rules:
//! - ids: hyphenated UUID text; optional ids encode `None` as the empty string
//! - booleans: `"true"` / `"false"`
//! - timestamps: decimal milliseconds since Unix epoch; optional ones use `""`
//! - id sets: JSON array of UUID strings, sorted
//! - optional text: `""` means `None`

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while decoding or applying entity fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("unknown field `{key}` for {kind}")]
    UnknownField { kind: EntityKind, key: String },
    #[error("invalid value `{value}` for {kind}.{key}")]
    InvalidValue {
        kind: EntityKind,
        key: &'static str,
        value: String,
    },
}

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// The four replicated entity kinds. Each kind has its own record key prefix
/// and its own propagation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Node,
    Worker,
    Session,
    Group,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Node,
        EntityKind::Worker,
        EntityKind::Session,
        EntityKind::Group,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Worker => "worker",
            EntityKind::Session => "session",
            EntityKind::Group => "group",
        }
    }

    /// Store key of the record holding entity `id`.
    #[must_use]
    pub fn record_key(self, id: Uuid) -> String {
        format!("{}:{id}", self.as_str())
    }

    /// Prefix shared by every record key of this kind.
    #[must_use]
    pub fn key_prefix(self) -> String {
        format!("{}:", self.as_str())
    }

    /// Name of the pub/sub channel carrying field updates for this kind.
    #[must_use]
    pub fn channel(self) -> &'static str {
        match self {
            EntityKind::Node => "fleet:update:node",
            EntityKind::Worker => "fleet:update:worker",
            EntityKind::Session => "fleet:update:session",
            EntityKind::Group => "fleet:update:group",
        }
    }

    /// Field keys a propagation message for this kind may carry.
    #[must_use]
    pub fn allowed_field_keys(self) -> Vec<&'static str> {
        fn keys<F: FieldKey>() -> Vec<&'static str> {
            F::ALL.iter().map(|f| f.as_str()).collect()
        }
        match self {
            EntityKind::Node => keys::<NodeField>(),
            EntityKind::Worker => keys::<WorkerField>(),
            EntityKind::Session => keys::<SessionField>(),
            EntityKind::Group => keys::<GroupField>(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Field keys
// ---------------------------------------------------------------------------

/// A closed set of field keys for one entity kind.
pub trait FieldKey: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every key, in record order.
    const ALL: &'static [Self];

    /// Wire name of the field.
    fn as_str(self) -> &'static str;

    /// Parses a wire name; `None` for keys outside the allowed set.
    fn parse(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == key)
    }
}

macro_rules! field_keys {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl FieldKey for $name {
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }
    };
}

field_keys!(
    /// Fields of a [`ClusterNode`] record.
    NodeField {
        Address => "address",
        Maintenance => "maintenance",
        Workers => "workers",
        Sessions => "sessions",
        LastHeartbeat => "last_heartbeat",
    }
);

field_keys!(
    /// Fields of a [`Worker`] record.
    WorkerField {
        Address => "address",
        Node => "node",
        Maintenance => "maintenance",
        Sessions => "sessions",
    }
);

field_keys!(
    /// Fields of a [`Session`] record.
    SessionField {
        Node => "node",
        Worker => "worker",
        Username => "username",
        Nickname => "nickname",
        Online => "online",
        Vanished => "vanished",
        LastSeen => "last_seen",
        Role => "role",
        Rank => "rank",
        Banned => "banned",
        BanReason => "ban_reason",
        BanPermanent => "ban_permanent",
        BanExpires => "ban_expires",
        Friends => "friends",
        IncomingRequests => "incoming_requests",
        OutgoingRequests => "outgoing_requests",
        Group => "group",
    }
);

field_keys!(
    /// Fields of a [`Group`] record.
    GroupField {
        Owner => "owner",
        Members => "members",
        Invitations => "invitations",
        JoinRequests => "join_requests",
    }
);

// ---------------------------------------------------------------------------
// Entity trait
// ---------------------------------------------------------------------------

/// A replicated record with a closed set of independently updatable fields.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;
    type Field: FieldKey;

    fn id(&self) -> Uuid;

    /// Empty record used as the base when decoding from the store.
    fn blank(id: Uuid) -> Self;

    /// Encodes a single field into its stored form.
    fn encode_field(&self, field: Self::Field) -> String;

    /// Decodes `raw` and overwrites `field` with it.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidValue`] when `raw` does not decode.
    fn apply_field(&mut self, field: Self::Field, raw: &str) -> Result<(), EntityError>;

    /// Encodes every field.
    fn to_record(&self) -> Vec<(String, String)> {
        Self::Field::ALL
            .iter()
            .map(|&f| (f.as_str().to_string(), self.encode_field(f)))
            .collect()
    }

    /// Decodes a full record. Missing fields keep their blank value.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys or undecodable values.
    fn from_record(id: Uuid, record: &HashMap<String, String>) -> Result<Self, EntityError> {
        let mut entity = Self::blank(id);
        for (key, raw) in record {
            let field = Self::Field::parse(key).ok_or_else(|| EntityError::UnknownField {
                kind: Self::KIND,
                key: key.clone(),
            })?;
            entity.apply_field(field, raw)?;
        }
        Ok(entity)
    }
}

// ---------------------------------------------------------------------------
// Field codecs
// ---------------------------------------------------------------------------

/// Stored string forms shared by every entity kind.
pub mod codec {
    use std::collections::BTreeSet;

    use uuid::Uuid;

    pub fn opt_id(id: Option<Uuid>) -> String {
        id.map(|id| id.to_string()).unwrap_or_default()
    }

    pub fn parse_opt_id(raw: &str) -> Option<Option<Uuid>> {
        if raw.is_empty() {
            Some(None)
        } else {
            Uuid::parse_str(raw).ok().map(Some)
        }
    }

    pub fn parse_bool(raw: &str) -> Option<bool> {
        match raw {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn opt_millis(value: Option<u64>) -> String {
        value.map(|v| v.to_string()).unwrap_or_default()
    }

    pub fn parse_opt_millis(raw: &str) -> Option<Option<u64>> {
        if raw.is_empty() {
            Some(None)
        } else {
            raw.parse().ok().map(Some)
        }
    }

    pub fn opt_text(value: Option<&String>) -> String {
        value.cloned().unwrap_or_default()
    }

    pub fn parse_opt_text(raw: &str) -> Option<String> {
        (!raw.is_empty()).then(|| raw.to_string())
    }

    pub fn id_set(ids: &BTreeSet<Uuid>) -> String {
        serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn parse_id_set(raw: &str) -> Option<BTreeSet<Uuid>> {
        if raw.is_empty() {
            return Some(BTreeSet::new());
        }
        serde_json::from_str(raw).ok()
    }
}

fn invalid(kind: EntityKind, key: &'static str, raw: &str) -> EntityError {
    EntityError::InvalidValue {
        kind,
        key,
        value: raw.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Permission enums
// ---------------------------------------------------------------------------

/// Administrative permission role. Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Default,
    Builder,
    Moderator,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Default => "default",
            Role::Builder => "builder",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "default" => Some(Role::Default),
            "builder" => Some(Role::Builder),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Cosmetic rank, independent of [`Role`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    #[default]
    Default,
    Elite,
    Champion,
    Legend,
}

impl Rank {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Rank::Default => "default",
            Rank::Elite => "elite",
            Rank::Champion => "champion",
            Rank::Legend => "legend",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "default" => Some(Rank::Default),
            "elite" => Some(Rank::Elite),
            "champion" => Some(Rank::Champion),
            "legend" => Some(Rank::Legend),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterNode
// ---------------------------------------------------------------------------

/// One live proxy process.
///
/// `worker_ids` and `session_ids` are the index the crash sweep walks; they
/// mirror `Worker::node_id` and `Session::node_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: Uuid,
    pub address: String,
    pub maintenance: bool,
    pub worker_ids: BTreeSet<Uuid>,
    pub session_ids: BTreeSet<Uuid>,
    pub last_heartbeat: Option<u64>,
}

impl ClusterNode {
    #[must_use]
    pub fn new(id: Uuid, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::blank(id)
        }
    }

    /// Returns `true` when the last heartbeat is missing or older than
    /// `threshold_ms` at time `now`.
    #[must_use]
    pub fn is_stale(&self, now: u64, threshold_ms: u64) -> bool {
        match self.last_heartbeat {
            Some(beat) => now.saturating_sub(beat) > threshold_ms,
            None => true,
        }
    }
}

impl Entity for ClusterNode {
    const KIND: EntityKind = EntityKind::Node;
    type Field = NodeField;

    fn id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            address: String::new(),
            maintenance: false,
            worker_ids: BTreeSet::new(),
            session_ids: BTreeSet::new(),
            last_heartbeat: None,
        }
    }

    fn encode_field(&self, field: NodeField) -> String {
        match field {
            NodeField::Address => self.address.clone(),
            NodeField::Maintenance => self.maintenance.to_string(),
            NodeField::Workers => codec::id_set(&self.worker_ids),
            NodeField::Sessions => codec::id_set(&self.session_ids),
            NodeField::LastHeartbeat => codec::opt_millis(self.last_heartbeat),
        }
    }

    fn apply_field(&mut self, field: NodeField, raw: &str) -> Result<(), EntityError> {
        let bad = || invalid(Self::KIND, field.as_str(), raw);
        match field {
            NodeField::Address => self.address = raw.to_string(),
            NodeField::Maintenance => self.maintenance = codec::parse_bool(raw).ok_or_else(bad)?,
            NodeField::Workers => self.worker_ids = codec::parse_id_set(raw).ok_or_else(bad)?,
            NodeField::Sessions => self.session_ids = codec::parse_id_set(raw).ok_or_else(bad)?,
            NodeField::LastHeartbeat => {
                self.last_heartbeat = codec::parse_opt_millis(raw).ok_or_else(bad)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A backend server instance owned by one cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub id: Uuid,
    pub address: String,
    pub node_id: Uuid,
    pub maintenance: bool,
    pub session_ids: BTreeSet<Uuid>,
}

impl Worker {
    #[must_use]
    pub fn new(id: Uuid, address: impl Into<String>, node_id: Uuid) -> Self {
        Self {
            address: address.into(),
            node_id,
            ..Self::blank(id)
        }
    }
}

impl Entity for Worker {
    const KIND: EntityKind = EntityKind::Worker;
    type Field = WorkerField;

    fn id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            address: String::new(),
            node_id: Uuid::nil(),
            maintenance: false,
            session_ids: BTreeSet::new(),
        }
    }

    fn encode_field(&self, field: WorkerField) -> String {
        match field {
            WorkerField::Address => self.address.clone(),
            WorkerField::Node => self.node_id.to_string(),
            WorkerField::Maintenance => self.maintenance.to_string(),
            WorkerField::Sessions => codec::id_set(&self.session_ids),
        }
    }

    fn apply_field(&mut self, field: WorkerField, raw: &str) -> Result<(), EntityError> {
        let bad = || invalid(Self::KIND, field.as_str(), raw);
        match field {
            WorkerField::Address => self.address = raw.to_string(),
            WorkerField::Node => self.node_id = Uuid::parse_str(raw).map_err(|_| bad())?,
            WorkerField::Maintenance => {
                self.maintenance = codec::parse_bool(raw).ok_or_else(bad)?;
            }
            WorkerField::Sessions => self.session_ids = codec::parse_id_set(raw).ok_or_else(bad)?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Ban state carried by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanState {
    pub banned: bool,
    pub reason: Option<String>,
    pub permanent: bool,
    /// Expiry in epoch millis. Ignored when `permanent` is set.
    pub expires_at: Option<u64>,
}

impl BanState {
    /// Returns `true` when the ban is in force at time `now`.
    #[must_use]
    pub fn is_active(&self, now: u64) -> bool {
        if !self.banned {
            return false;
        }
        if self.permanent {
            return true;
        }
        self.expires_at.is_some_and(|expires| now < expires)
    }
}

/// A connected (or previously connected) client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    /// `None` while offline or mid-transfer.
    pub node_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub username: String,
    pub nickname: Option<String>,
    pub online: bool,
    pub vanished: bool,
    pub last_seen: Option<u64>,
    pub role: Role,
    pub rank: Rank,
    pub ban: BanState,
    pub friend_ids: BTreeSet<Uuid>,
    pub incoming_request_ids: BTreeSet<Uuid>,
    pub outgoing_request_ids: BTreeSet<Uuid>,
    pub group_id: Option<Uuid>,
}

impl Session {
    /// First-login defaults: default role and rank, no relations, offline.
    #[must_use]
    pub fn new(id: Uuid, username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::blank(id)
        }
    }

    /// Name shown to other players.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.username)
    }

    /// Checks the online/node invariant. Returns a description of the
    /// violation, if any.
    #[must_use]
    pub fn invariant_violation(&self) -> Option<String> {
        (self.online && self.node_id.is_none())
            .then(|| format!("session {} is online without a node", self.id))
    }
}

impl Entity for Session {
    const KIND: EntityKind = EntityKind::Session;
    type Field = SessionField;

    fn id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            node_id: None,
            worker_id: None,
            username: String::new(),
            nickname: None,
            online: false,
            vanished: false,
            last_seen: None,
            role: Role::Default,
            rank: Rank::Default,
            ban: BanState::default(),
            friend_ids: BTreeSet::new(),
            incoming_request_ids: BTreeSet::new(),
            outgoing_request_ids: BTreeSet::new(),
            group_id: None,
        }
    }

    fn encode_field(&self, field: SessionField) -> String {
        match field {
            SessionField::Node => codec::opt_id(self.node_id),
            SessionField::Worker => codec::opt_id(self.worker_id),
            SessionField::Username => self.username.clone(),
            SessionField::Nickname => codec::opt_text(self.nickname.as_ref()),
            SessionField::Online => self.online.to_string(),
            SessionField::Vanished => self.vanished.to_string(),
            SessionField::LastSeen => codec::opt_millis(self.last_seen),
            SessionField::Role => self.role.as_str().to_string(),
            SessionField::Rank => self.rank.as_str().to_string(),
            SessionField::Banned => self.ban.banned.to_string(),
            SessionField::BanReason => codec::opt_text(self.ban.reason.as_ref()),
            SessionField::BanPermanent => self.ban.permanent.to_string(),
            SessionField::BanExpires => codec::opt_millis(self.ban.expires_at),
            SessionField::Friends => codec::id_set(&self.friend_ids),
            SessionField::IncomingRequests => codec::id_set(&self.incoming_request_ids),
            SessionField::OutgoingRequests => codec::id_set(&self.outgoing_request_ids),
            SessionField::Group => codec::opt_id(self.group_id),
        }
    }

    fn apply_field(&mut self, field: SessionField, raw: &str) -> Result<(), EntityError> {
        let bad = || invalid(Self::KIND, field.as_str(), raw);
        match field {
            SessionField::Node => self.node_id = codec::parse_opt_id(raw).ok_or_else(bad)?,
            SessionField::Worker => self.worker_id = codec::parse_opt_id(raw).ok_or_else(bad)?,
            SessionField::Username => self.username = raw.to_string(),
            SessionField::Nickname => self.nickname = codec::parse_opt_text(raw),
            SessionField::Online => self.online = codec::parse_bool(raw).ok_or_else(bad)?,
            SessionField::Vanished => self.vanished = codec::parse_bool(raw).ok_or_else(bad)?,
            SessionField::LastSeen => {
                self.last_seen = codec::parse_opt_millis(raw).ok_or_else(bad)?;
            }
            SessionField::Role => self.role = Role::parse(raw).ok_or_else(bad)?,
            SessionField::Rank => self.rank = Rank::parse(raw).ok_or_else(bad)?,
            SessionField::Banned => self.ban.banned = codec::parse_bool(raw).ok_or_else(bad)?,
            SessionField::BanReason => self.ban.reason = codec::parse_opt_text(raw),
            SessionField::BanPermanent => {
                self.ban.permanent = codec::parse_bool(raw).ok_or_else(bad)?;
            }
            SessionField::BanExpires => {
                self.ban.expires_at = codec::parse_opt_millis(raw).ok_or_else(bad)?;
            }
            SessionField::Friends => self.friend_ids = codec::parse_id_set(raw).ok_or_else(bad)?,
            SessionField::IncomingRequests => {
                self.incoming_request_ids = codec::parse_id_set(raw).ok_or_else(bad)?;
            }
            SessionField::OutgoingRequests => {
                self.outgoing_request_ids = codec::parse_id_set(raw).ok_or_else(bad)?;
            }
            SessionField::Group => self.group_id = codec::parse_opt_id(raw).ok_or_else(bad)?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A short-lived, owner-led party of sessions. The owner is always a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub member_ids: BTreeSet<Uuid>,
    pub invitation_ids: BTreeSet<Uuid>,
    pub join_request_ids: BTreeSet<Uuid>,
}

impl Group {
    /// A fresh group containing only its creator.
    #[must_use]
    pub fn new(id: Uuid, owner_id: Uuid) -> Self {
        let mut group = Self::blank(id);
        group.owner_id = owner_id;
        group.member_ids.insert(owner_id);
        group
    }
}

impl Entity for Group {
    const KIND: EntityKind = EntityKind::Group;
    type Field = GroupField;

    fn id(&self) -> Uuid {
        self.id
    }

    fn blank(id: Uuid) -> Self {
        Self {
            id,
            owner_id: Uuid::nil(),
            member_ids: BTreeSet::new(),
            invitation_ids: BTreeSet::new(),
            join_request_ids: BTreeSet::new(),
        }
    }

    fn encode_field(&self, field: GroupField) -> String {
        match field {
            GroupField::Owner => self.owner_id.to_string(),
            GroupField::Members => codec::id_set(&self.member_ids),
            GroupField::Invitations => codec::id_set(&self.invitation_ids),
            GroupField::JoinRequests => codec::id_set(&self.join_request_ids),
        }
    }

    fn apply_field(&mut self, field: GroupField, raw: &str) -> Result<(), EntityError> {
        let bad = || invalid(Self::KIND, field.as_str(), raw);
        match field {
            GroupField::Owner => self.owner_id = Uuid::parse_str(raw).map_err(|_| bad())?,
            GroupField::Members => self.member_ids = codec::parse_id_set(raw).ok_or_else(bad)?,
            GroupField::Invitations => {
                self.invitation_ids = codec::parse_id_set(raw).ok_or_else(bad)?;
            }
            GroupField::JoinRequests => {
                self.join_request_ids = codec::parse_id_set(raw).ok_or_else(bad)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn record_keys_and_channels_are_per_kind() {
        assert_eq!(
            EntityKind::Session.record_key(id(1)),
            format!("session:{}", id(1))
        );
        assert_eq!(EntityKind::Node.key_prefix(), "node:");
        let channels: BTreeSet<_> = EntityKind::ALL.iter().map(|k| k.channel()).collect();
        assert_eq!(channels.len(), 4);
    }

    #[test]
    fn field_key_parse_rejects_unknown_keys() {
        assert_eq!(SessionField::parse("ban_reason"), Some(SessionField::BanReason));
        assert_eq!(NodeField::parse("last_heartbeat"), Some(NodeField::LastHeartbeat));
        assert_eq!(SessionField::parse("password"), None);
        assert_eq!(GroupField::parse("new"), None);
        assert_eq!(GroupField::parse("delete"), None);
    }

    #[test]
    fn session_record_survives_store_encoding() {
        let mut session = Session::new(id(7), "Steve");
        session.node_id = Some(id(1));
        session.worker_id = Some(id(2));
        session.online = true;
        session.role = Role::Moderator;
        session.rank = Rank::Legend;
        session.ban = BanState {
            banned: true,
            reason: Some("griefing_spawn".to_string()),
            permanent: false,
            expires_at: Some(9_000),
        };
        session.friend_ids.insert(id(8));
        session.group_id = Some(id(3));

        let record: HashMap<String, String> = session.to_record().into_iter().collect();
        let decoded = Session::from_record(id(7), &record).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn empty_strings_decode_to_none() {
        let mut session = Session::new(id(1), "alex");
        session.apply_field(SessionField::Node, "").unwrap();
        session.apply_field(SessionField::LastSeen, "").unwrap();
        session.apply_field(SessionField::Nickname, "").unwrap();
        session.apply_field(SessionField::Friends, "").unwrap();
        assert_eq!(session.node_id, None);
        assert_eq!(session.last_seen, None);
        assert_eq!(session.nickname, None);
        assert!(session.friend_ids.is_empty());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut node = ClusterNode::new(id(1), "10.0.0.1:25565");
        let err = node.apply_field(NodeField::Maintenance, "yes").unwrap_err();
        assert!(matches!(
            err,
            EntityError::InvalidValue { key: "maintenance", .. }
        ));

        let mut session = Session::new(id(2), "alex");
        assert!(session.apply_field(SessionField::Role, "owner").is_err());
        assert!(session.apply_field(SessionField::Worker, "not-a-uuid").is_err());
    }

    #[test]
    fn from_record_rejects_unknown_field() {
        let record = HashMap::from([("colour".to_string(), "red".to_string())]);
        let err = Group::from_record(id(1), &record).unwrap_err();
        assert!(matches!(err, EntityError::UnknownField { kind: EntityKind::Group, .. }));
    }

    #[test]
    fn stale_heartbeat_detection() {
        let mut node = ClusterNode::new(id(1), "a");
        assert!(node.is_stale(1_000, 500), "missing heartbeat is stale");
        node.last_heartbeat = Some(1_000);
        assert!(!node.is_stale(1_400, 500));
        assert!(!node.is_stale(1_500, 500));
        assert!(node.is_stale(1_501, 500));
    }

    #[test]
    fn ban_expiry() {
        let temp = BanState {
            banned: true,
            reason: None,
            permanent: false,
            expires_at: Some(100),
        };
        assert!(temp.is_active(99));
        assert!(!temp.is_active(100));

        let perm = BanState {
            banned: true,
            permanent: true,
            ..BanState::default()
        };
        assert!(perm.is_active(u64::MAX));
        assert!(!BanState::default().is_active(0));
    }

    #[test]
    fn group_owner_is_member() {
        let group = Group::new(id(5), id(9));
        assert_eq!(group.owner_id, id(9));
        assert!(group.member_ids.contains(&id(9)));
    }

    #[test]
    fn online_without_node_is_a_violation() {
        let mut session = Session::new(id(1), "alex");
        assert!(session.invariant_violation().is_none());
        session.online = true;
        assert!(session.invariant_violation().is_some());
        session.node_id = Some(id(2));
        assert!(session.invariant_violation().is_none());
    }

    #[test]
    fn role_ordering_reflects_privilege() {
        assert!(Role::Admin > Role::Moderator);
        assert!(Role::Moderator > Role::Builder);
        assert!(Role::Builder > Role::Default);
    }
}
