//! Fleet Core: replicated entity records, field keys, wire formats, and clock.

pub mod clock;
pub mod entity;
pub mod wire;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use entity::{
    codec, BanState, ClusterNode, Entity, EntityError, EntityKind, FieldKey, Group, GroupField,
    NodeField, Rank, Role, Session, SessionField, Worker, WorkerField,
};
pub use wire::{
    is_allowed_update_key, MalformedPayload, PropagationMessage, RedirectToken, TaskResult,
    TransferStatus, UpdateKind, FIELD_DELETE, FIELD_NEW,
};
