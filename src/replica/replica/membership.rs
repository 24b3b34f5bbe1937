//! Membership changes through a joint configuration.
//!
//! New replicas first join as staging peers: they receive the log but don't vote. Once every one
//! of them has caught up, the leader appends the joint configuration (old and new voters, both
//! majorities needed), and once that's committed, the new configuration on its own.

use super::{ChangeMembershipCallback, Replica};
use crate::commitlog::Index;
use crate::replica::cluster::{ClusterConfiguration, ReplicaMetadata};
use crate::replica::{
    ChangeMembershipError, ChangeMembershipInput, ChangeMembershipOutput, EntryPayload, ReplicaId,
    WriteAheadLogEntry,
};
use std::collections::HashSet;
use std::io;

pub(super) struct MembershipChange {
    new_members: Vec<ReplicaMetadata>,
    pub(super) callback: ChangeMembershipCallback,
    phase: Phase,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    /// Waiting for staging peers to catch up.
    Staging,
    /// Joint configuration appended at this index.
    Joint(Index),
    /// New configuration appended at this index.
    Stable(Index),
}

impl Replica {
    pub(crate) fn handle_change_membership(
        &mut self,
        input: ChangeMembershipInput,
        callback: ChangeMembershipCallback,
    ) {
        if let Err(e) = self.validate_membership_change(&input) {
            callback.send(Err(e));
            return;
        }

        let current_voters = self.cluster_tracker.current().voter_ids();
        let staging: Vec<ReplicaId> = input
            .new_members
            .iter()
            .map(|member| member.replica_id().clone())
            .filter(|id| !current_voters.contains(id) && *id != self.my_replica_id)
            .collect();
        slog::info!(
            self.logger,
            "Changing membership to {:?}. Staging {:?}.",
            input.new_members,
            staging
        );

        for member in &input.new_members {
            self.cluster_tracker.add_known_replica(member.clone());
        }

        let next_index = self
            .write_ahead_log
            .latest_index()
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        for peer_id in &staging {
            let peer = match self.cluster_tracker.peer(peer_id) {
                Some(peer) => peer,
                None => {
                    callback.send(Err(ChangeMembershipError::InvalidConfiguration(format!(
                        "Can't reach {:?}",
                        peer_id
                    ))));
                    return;
                }
            };
            if let Some(leader_state) = self.election_state.leader_state_mut() {
                leader_state.add_peer(peer, next_index, true);
            }
        }

        self.membership_change = Some(MembershipChange {
            new_members: input.new_members,
            callback,
            phase: Phase::Staging,
        });
        self.advance_membership_change();
    }

    fn validate_membership_change(&self, input: &ChangeMembershipInput) -> Result<(), ChangeMembershipError> {
        if let Some(reason) = self.election_state.halted_reason() {
            return Err(ChangeMembershipError::Halted(reason.to_string()));
        }
        if !self.election_state.is_leader() {
            return match self.election_state.known_leader() {
                Some(leader) => Err(ChangeMembershipError::LeaderRedirect(leader.clone())),
                None => Err(ChangeMembershipError::NoLeader),
            };
        }
        // One change at a time. A joint configuration left by a previous leader is finished
        // first.
        if self.membership_change.is_some() || self.cluster_tracker.current().is_joint() {
            return Err(ChangeMembershipError::InProgress);
        }

        if input.new_members.is_empty() {
            return Err(ChangeMembershipError::InvalidConfiguration(
                "Configuration needs at least one member".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for member in &input.new_members {
            if !ids.insert(member.replica_id()) {
                return Err(ChangeMembershipError::InvalidConfiguration(format!(
                    "{:?} is listed more than once",
                    member.replica_id()
                )));
            }
        }

        Ok(())
    }

    /// Moves a membership change along as far as it can go right now. Called whenever the commit
    /// index or a peer's progress may have moved.
    pub(super) fn advance_membership_change(&mut self) {
        if !self.election_state.is_leader() {
            return;
        }

        let phase = match &self.membership_change {
            Some(change) => change.phase,
            None => {
                self.finish_configuration_from_previous_term();
                return;
            }
        };

        let result = match phase {
            Phase::Staging if self.staging_peers_caught_up() => self.enter_joint_configuration(),
            Phase::Joint(index) if self.is_committed(index) => self.enter_new_configuration(),
            Phase::Stable(index) if self.is_committed(index) => {
                self.complete_membership_change(index);
                return;
            }
            _ => return,
        };

        match result {
            // Single voter clusters commit right away.
            Ok(()) => self.advance_leader_commit_index(),
            Err(e) => self.halt(format!("Failed to append configuration: {:?}", e)),
        }
    }

    fn staging_peers_caught_up(&self) -> bool {
        let commit_index = self.write_ahead_log.commit_index();
        let gap = self.options.staging_catchup_gap;
        match self.election_state.leader_state() {
            Some(leader_state) => leader_state
                .peers_iter()
                .filter(|ps| ps.is_staging())
                .all(|ps| ps.is_caught_up(commit_index, gap)),
            None => false,
        }
    }

    fn is_committed(&self, index: Index) -> bool {
        matches!(self.write_ahead_log.commit_index(), Some(ci) if ci >= index)
    }

    fn enter_joint_configuration(&mut self) -> Result<(), io::Error> {
        let new_members = match &self.membership_change {
            Some(change) => change.new_members.clone(),
            None => return Ok(()),
        };
        let joint = self.cluster_tracker.current().to_joint(new_members);
        let index = self.append_configuration(joint)?;

        if let Some(leader_state) = self.election_state.leader_state_mut() {
            for ps in leader_state.peers_iter_mut() {
                ps.promote();
            }
        }
        if let Some(change) = self.membership_change.as_mut() {
            change.phase = Phase::Joint(index);
        }
        Ok(())
    }

    fn enter_new_configuration(&mut self) -> Result<(), io::Error> {
        let stable = self.cluster_tracker.current().to_stable();
        let index = self.append_configuration(stable)?;

        if let Some(change) = self.membership_change.as_mut() {
            change.phase = Phase::Stable(index);
        }
        Ok(())
    }

    fn complete_membership_change(&mut self, index: Index) {
        if let Some(change) = self.membership_change.take() {
            slog::info!(self.logger, "Membership change committed at {:?}", index);
            change.callback.send(Ok(ChangeMembershipOutput { committed_index: index }));
        }
        self.retire_removed_members();
    }

    /// A leader elected in the middle of a membership change finishes it, without anyone waiting
    /// on the result.
    fn finish_configuration_from_previous_term(&mut self) {
        let index = match self.cluster_tracker.current_index() {
            Some(index) if self.is_committed(index) => index,
            _ => return,
        };

        if self.cluster_tracker.current().is_joint() {
            slog::info!(self.logger, "Finishing membership change left at {:?}", index);
            match self.enter_new_configuration() {
                Ok(()) => self.advance_leader_commit_index(),
                Err(e) => self.halt(format!("Failed to append configuration: {:?}", e)),
            }
        } else {
            self.retire_removed_members();
        }
    }

    /// Stops replicating to replicas that are no longer voters, and steps down if we're one of
    /// them.
    fn retire_removed_members(&mut self) {
        let voters = self.cluster_tracker.current().voter_ids();
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            let removed: Vec<_> = leader_state
                .peers_iter()
                .filter(|ps| !ps.is_staging() && !voters.contains(ps.peer_id()))
                .map(|ps| ps.peer_id().clone())
                .collect();
            for peer_id in removed {
                leader_state.remove_peer(&peer_id);
            }
        }

        if !voters.contains(&self.my_replica_id) {
            slog::info!(self.logger, "No longer a voter. Stepping down.");
            self.become_follower(None);
        }
    }

    /// Appends a configuration entry. It takes effect right away, before it's committed.
    fn append_configuration(&mut self, configuration: ClusterConfiguration) -> Result<Index, io::Error> {
        let entry = WriteAheadLogEntry {
            term: self.current_term(),
            payload: EntryPayload::Configuration(configuration.clone()),
        };
        let index = self.write_ahead_log.append(vec![entry])?;
        slog::info!(self.logger, "Appended configuration at {:?}: {:?}", index, configuration);
        self.cluster_tracker.on_configuration_appended(index, configuration);

        // Voters we're not replicating to yet start from the configuration entry.
        for peer_id in self.cluster_tracker.peer_ids() {
            let tracked = self
                .election_state
                .leader_state()
                .map(|leader_state| leader_state.peer_state(&peer_id).is_some())
                .unwrap_or(true);
            if tracked {
                continue;
            }
            if let Some(peer) = self.cluster_tracker.peer(&peer_id) {
                if let Some(leader_state) = self.election_state.leader_state_mut() {
                    leader_state.add_peer(peer, index, false);
                }
            }
        }

        self.replicate_to_all_peers(false);
        Ok(index)
    }
}
