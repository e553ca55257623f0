//! Friend relations and groups.
//!
//! Friend sets are symmetric: each operation writes both sessions. Group
//! membership is mirrored by `Session::group_id`.

use fleet_core::{Group, GroupField, Session, SessionField};
use tracing::debug;
use uuid::Uuid;

use super::entities::EntityManager;
use super::types::ClusterError;

const FRIEND_FIELDS: [SessionField; 3] = [
    SessionField::Friends,
    SessionField::IncomingRequests,
    SessionField::OutgoingRequests,
];

impl EntityManager {
    // -- Friends -----------------------------------------------------------

    /// Sends a friend request from `from` to `to`. If `to` already asked
    /// `from`, the two become friends straight away.
    ///
    /// Returns `true` when the sessions are now friends.
    ///
    /// # Errors
    ///
    /// `Rejected` for self-requests, existing friendships and duplicate
    /// requests; `NotFound` for unknown sessions.
    pub async fn send_friend_request(&self, from: Uuid, to: Uuid) -> Result<bool, ClusterError> {
        if from == to {
            return Err(ClusterError::rejected("cannot befriend yourself"));
        }
        let sender = self.get::<Session>(from).await?;
        self.get::<Session>(to).await?;
        if sender.friend_ids.contains(&to) {
            return Err(ClusterError::rejected("already friends"));
        }
        if sender.incoming_request_ids.contains(&to) {
            self.accept_friend_request(from, to).await?;
            return Ok(true);
        }
        if sender.outgoing_request_ids.contains(&to) {
            return Err(ClusterError::rejected("friend request already sent"));
        }

        self.update::<Session, _>(from, &[SessionField::OutgoingRequests], |s| {
            s.outgoing_request_ids.insert(to);
        })
        .await?;
        self.update::<Session, _>(to, &[SessionField::IncomingRequests], |s| {
            s.incoming_request_ids.insert(from);
        })
        .await?;
        Ok(false)
    }

    /// # Errors
    ///
    /// `Rejected` when `requester` has no pending request to `accepter`.
    pub async fn accept_friend_request(
        &self,
        accepter: Uuid,
        requester: Uuid,
    ) -> Result<(), ClusterError> {
        let session = self.get::<Session>(accepter).await?;
        if !session.incoming_request_ids.contains(&requester) {
            return Err(ClusterError::rejected("no pending friend request"));
        }
        self.update::<Session, _>(accepter, &FRIEND_FIELDS, |s| {
            s.incoming_request_ids.remove(&requester);
            s.outgoing_request_ids.remove(&requester);
            s.friend_ids.insert(requester);
        })
        .await?;
        self.update::<Session, _>(requester, &FRIEND_FIELDS, |s| {
            s.outgoing_request_ids.remove(&accepter);
            s.incoming_request_ids.remove(&accepter);
            s.friend_ids.insert(accepter);
        })
        .await?;
        debug!(%accepter, %requester, "friend request accepted");
        Ok(())
    }

    /// # Errors
    ///
    /// `Rejected` when `requester` has no pending request to `denier`.
    pub async fn deny_friend_request(&self, denier: Uuid, requester: Uuid) -> Result<(), ClusterError> {
        let session = self.get::<Session>(denier).await?;
        if !session.incoming_request_ids.contains(&requester) {
            return Err(ClusterError::rejected("no pending friend request"));
        }
        self.update::<Session, _>(denier, &[SessionField::IncomingRequests], |s| {
            s.incoming_request_ids.remove(&requester);
        })
        .await?;
        self.update::<Session, _>(requester, &[SessionField::OutgoingRequests], |s| {
            s.outgoing_request_ids.remove(&denier);
        })
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `Rejected` when the sessions are not friends.
    pub async fn remove_friend(&self, session_id: Uuid, friend_id: Uuid) -> Result<(), ClusterError> {
        let session = self.get::<Session>(session_id).await?;
        if !session.friend_ids.contains(&friend_id) {
            return Err(ClusterError::rejected("not friends"));
        }
        self.update::<Session, _>(session_id, &[SessionField::Friends], |s| {
            s.friend_ids.remove(&friend_id);
        })
        .await?;
        match self
            .update::<Session, _>(friend_id, &[SessionField::Friends], |s| {
                s.friend_ids.remove(&session_id);
            })
            .await
        {
            Ok(_) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // -- Groups ------------------------------------------------------------

    /// Forms a group with `owner` as its only member.
    ///
    /// # Errors
    ///
    /// `Rejected` when the owner is already in a group.
    pub async fn create_group(&self, owner: Uuid) -> Result<Group, ClusterError> {
        let session = self.get::<Session>(owner).await?;
        if session.group_id.is_some() {
            return Err(ClusterError::rejected("already in a group"));
        }
        let group = self.create(Group::new(Uuid::new_v4(), owner)).await?;
        self.set_session_group(owner, Some(group.id)).await?;
        debug!(group_id = %group.id, %owner, "group created");
        Ok(group)
    }

    /// Invites `invitee`; only the owner may invite.
    ///
    /// # Errors
    ///
    /// `Rejected` for non-owners and sessions that are already members.
    pub async fn invite(&self, group_id: Uuid, inviter: Uuid, invitee: Uuid) -> Result<Group, ClusterError> {
        let group = self.get::<Group>(group_id).await?;
        require_owner(&group, inviter)?;
        if group.member_ids.contains(&invitee) {
            return Err(ClusterError::rejected("already a member"));
        }
        self.get::<Session>(invitee).await?;
        self.update::<Group, _>(group_id, &[GroupField::Invitations], |g| {
            g.invitation_ids.insert(invitee);
        })
        .await
    }

    /// # Errors
    ///
    /// `Rejected` without a pending invitation or while in another group.
    pub async fn accept_invite(&self, group_id: Uuid, session_id: Uuid) -> Result<Group, ClusterError> {
        let group = self.get::<Group>(group_id).await?;
        if !group.invitation_ids.contains(&session_id) {
            return Err(ClusterError::rejected("no pending invitation"));
        }
        self.join(group_id, session_id).await
    }

    /// # Errors
    ///
    /// `Rejected` for members and sessions already in a group.
    pub async fn request_join(&self, group_id: Uuid, session_id: Uuid) -> Result<Group, ClusterError> {
        let group = self.get::<Group>(group_id).await?;
        if group.member_ids.contains(&session_id) {
            return Err(ClusterError::rejected("already a member"));
        }
        let session = self.get::<Session>(session_id).await?;
        if session.group_id.is_some() {
            return Err(ClusterError::rejected("already in a group"));
        }
        self.update::<Group, _>(group_id, &[GroupField::JoinRequests], |g| {
            g.join_request_ids.insert(session_id);
        })
        .await
    }

    /// # Errors
    ///
    /// `Rejected` for non-owners or when `requester` never asked to join.
    pub async fn accept_join_request(
        &self,
        group_id: Uuid,
        owner: Uuid,
        requester: Uuid,
    ) -> Result<Group, ClusterError> {
        let group = self.get::<Group>(group_id).await?;
        require_owner(&group, owner)?;
        if !group.join_request_ids.contains(&requester) {
            return Err(ClusterError::rejected("no pending join request"));
        }
        self.join(group_id, requester).await
    }

    async fn join(&self, group_id: Uuid, session_id: Uuid) -> Result<Group, ClusterError> {
        let session = self.get::<Session>(session_id).await?;
        if session.group_id.is_some_and(|g| g != group_id) {
            return Err(ClusterError::rejected("already in a group"));
        }
        let group = self
            .update::<Group, _>(
                group_id,
                &[
                    GroupField::Members,
                    GroupField::Invitations,
                    GroupField::JoinRequests,
                ],
                |g| {
                    g.member_ids.insert(session_id);
                    g.invitation_ids.remove(&session_id);
                    g.join_request_ids.remove(&session_id);
                },
            )
            .await?;
        self.set_session_group(session_id, Some(group_id)).await?;
        Ok(group)
    }

    /// Removes a session from its group. An owner leaving hands ownership to
    /// the remaining member with the lowest id; the last member leaving
    /// deletes the group.
    ///
    /// Returns the group afterwards, or `None` when it was deleted.
    ///
    /// # Errors
    ///
    /// `Rejected` when the session is not in a group.
    pub async fn leave_group(&self, session_id: Uuid) -> Result<Option<Group>, ClusterError> {
        let session = self.get::<Session>(session_id).await?;
        let group_id = session
            .group_id
            .ok_or_else(|| ClusterError::rejected("not in a group"))?;
        self.set_session_group(session_id, None).await?;

        let group = self.get::<Group>(group_id).await?;
        let remaining: Vec<Uuid> = group
            .member_ids
            .iter()
            .copied()
            .filter(|&m| m != session_id)
            .collect();
        let Some(&successor) = remaining.first() else {
            self.delete::<Group>(group_id).await?;
            debug!(group_id = %group_id, "last member left, group deleted");
            return Ok(None);
        };

        let updated = self
            .update::<Group, _>(group_id, &[GroupField::Members, GroupField::Owner], |g| {
                g.member_ids.remove(&session_id);
                if g.owner_id == session_id {
                    g.owner_id = successor;
                }
            })
            .await?;
        Ok(Some(updated))
    }

    /// # Errors
    ///
    /// `Rejected` for non-owners, self-kicks and non-members.
    pub async fn kick_member(&self, group_id: Uuid, owner: Uuid, member: Uuid) -> Result<Group, ClusterError> {
        let group = self.get::<Group>(group_id).await?;
        require_owner(&group, owner)?;
        if member == owner {
            return Err(ClusterError::rejected("owner cannot kick themselves"));
        }
        if !group.member_ids.contains(&member) {
            return Err(ClusterError::rejected("not a member"));
        }
        let group = self
            .update::<Group, _>(group_id, &[GroupField::Members], |g| {
                g.member_ids.remove(&member);
            })
            .await?;
        self.set_session_group(member, None).await?;
        Ok(group)
    }

    /// Deletes the group and clears every member's group reference.
    ///
    /// # Errors
    ///
    /// `Rejected` for non-owners.
    pub async fn disband(&self, group_id: Uuid, owner: Uuid) -> Result<(), ClusterError> {
        let group = self.get::<Group>(group_id).await?;
        require_owner(&group, owner)?;
        for member in &group.member_ids {
            self.set_session_group(*member, None).await?;
        }
        self.delete::<Group>(group_id).await
    }

    async fn set_session_group(&self, session_id: Uuid, group_id: Option<Uuid>) -> Result<(), ClusterError> {
        match self
            .update::<Session, _>(session_id, &[SessionField::Group], |s| s.group_id = group_id)
            .await
        {
            Ok(_) | Err(ClusterError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn require_owner(group: &Group, session_id: Uuid) -> Result<(), ClusterError> {
    if group.owner_id == session_id {
        Ok(())
    } else {
        Err(ClusterError::rejected("only the group owner can do that"))
    }
}
