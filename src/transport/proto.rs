//! Conversions between replica types and their protobuf messages. Requests from the wire are
//! validated here: anything malformed becomes `Status::invalid_argument`.

use crate::commitlog::Index;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_log_entry, proto_request_vote_error, proto_request_vote_result,
    ProtoAppendEntriesError, ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess,
    ProtoClientNotInCluster, ProtoClientStaleTerm, ProtoCommandEntry, ProtoConfiguration, ProtoInstallSnapshotError,
    ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess, ProtoLogEntry, ProtoMember,
    ProtoNoOpEntry, ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess,
    ProtoServerFault, ProtoServerMissingPreviousLog, ProtoSnapshotOffsetMismatch,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeerError, ClusterConfiguration,
    EntryPayload, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput,
    InstallSnapshotReplyFromPeerError, ReplicaId, ReplicaInfoBlob, ReplicaMetadata, RequestVoteError,
    RequestVoteInput, RequestVoteOutput, RequestVoteResult, SnapshotMetadata, Term, WriteAheadLogEntry,
};
use bytes::Bytes;
use std::convert::TryFrom;
use std::net::Ipv4Addr;
use tonic::Status;

// ------- Shared --------

fn member_to_proto(member: &ReplicaMetadata) -> ProtoMember {
    ProtoMember {
        replica_id: member.replica_id().as_str().to_string(),
        ip_addr: u32::from(member.ip_addr()),
        port: u32::from(member.port()),
        info_blob: member.info_blob().into_inner().to_be_bytes().to_vec(),
    }
}

fn member_from_proto(member: ProtoMember) -> Result<ReplicaMetadata, Status> {
    let port = u16::try_from(member.port).map_err(|_| Status::invalid_argument("Member port out of range"))?;
    let info_blob = <[u8; 16]>::try_from(member.info_blob.as_slice())
        .map(u128::from_be_bytes)
        .map_err(|_| Status::invalid_argument("Member info blob must be 16 bytes"))?;

    Ok(ReplicaMetadata::new(
        ReplicaId::new(member.replica_id),
        Ipv4Addr::from(member.ip_addr),
        port,
        ReplicaInfoBlob::new(info_blob),
    ))
}

pub(crate) fn configuration_to_proto(configuration: &ClusterConfiguration) -> ProtoConfiguration {
    ProtoConfiguration {
        members: configuration.members().iter().map(member_to_proto).collect(),
        joint: configuration.is_joint(),
        old_members: configuration
            .old_members()
            .map(|old| old.iter().map(member_to_proto).collect())
            .unwrap_or_default(),
    }
}

pub(crate) fn configuration_from_proto(configuration: ProtoConfiguration) -> Result<ClusterConfiguration, Status> {
    let members = configuration
        .members
        .into_iter()
        .map(member_from_proto)
        .collect::<Result<Vec<_>, _>>()?;

    if configuration.joint {
        let old_members = configuration
            .old_members
            .into_iter()
            .map(member_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClusterConfiguration::joint(old_members, members))
    } else {
        Ok(ClusterConfiguration::stable(members))
    }
}

fn log_entry_to_proto(entry: WriteAheadLogEntry) -> ProtoLogEntry {
    let payload = match entry.payload {
        EntryPayload::Command {
            client_id,
            call_id,
            data,
        } => proto_log_entry::Payload::Command(ProtoCommandEntry {
            client_id,
            call_id,
            data: data.to_vec(),
        }),
        EntryPayload::Configuration(configuration) => {
            proto_log_entry::Payload::Configuration(configuration_to_proto(&configuration))
        }
        EntryPayload::NoOp => proto_log_entry::Payload::NoOp(ProtoNoOpEntry {}),
    };

    ProtoLogEntry {
        term: entry.term.as_u64(),
        payload: Some(payload),
    }
}

fn log_entry_from_proto(entry: ProtoLogEntry) -> Result<WriteAheadLogEntry, Status> {
    let payload = match entry.payload {
        Some(proto_log_entry::Payload::Command(command)) => EntryPayload::Command {
            client_id: command.client_id,
            call_id: command.call_id,
            data: Bytes::from(command.data),
        },
        Some(proto_log_entry::Payload::Configuration(configuration)) => {
            EntryPayload::Configuration(configuration_from_proto(configuration)?)
        }
        Some(proto_log_entry::Payload::NoOp(_)) => EntryPayload::NoOp,
        None => return Err(Status::invalid_argument("Log entry without payload")),
    };

    Ok(WriteAheadLogEntry {
        term: Term::new(entry.term),
        payload,
    })
}

fn log_entry_metadata_to_proto(entry: Option<(Term, Index)>) -> (u64, u64) {
    match entry {
        None => (0, 0),
        Some((term, index)) => (term.as_u64(), index.as_u64()),
    }
}

fn log_entry_metadata_from_proto(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
    match (log_entry_term, log_entry_index) {
        (0, 0) => Ok(None),
        (0, _) => Err(Status::invalid_argument("LogEntryTerm 0 and LogEntryIndex non-0")),
        (_, 0) => Err(Status::invalid_argument("LogEntryIndex 0 and LogEntryTerm non-0")),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

fn server_fault(message: impl Into<String>) -> ProtoServerFault {
    ProtoServerFault {
        message: message.into(),
    }
}

// ------- RequestVote --------

pub(crate) fn request_vote_req_to_proto(input: RequestVoteInput) -> ProtoRequestVoteReq {
    let (last_log_entry_term, last_log_entry_index) = log_entry_metadata_to_proto(input.candidate_last_log_entry);

    ProtoRequestVoteReq {
        client_node_id: input.candidate_id.into_inner(),
        term: input.candidate_term.as_u64(),
        last_log_entry_index,
        last_log_entry_term,
        pre_vote: input.pre_vote,
    }
}

pub(crate) fn request_vote_req_from_proto(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
    let candidate_last_log_entry =
        log_entry_metadata_from_proto(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

    Ok(RequestVoteInput {
        candidate_term: Term::new(rpc_request.term),
        candidate_id: ReplicaId::new(rpc_request.client_node_id),
        candidate_last_log_entry,
        pre_vote: rpc_request.pre_vote,
    })
}

pub(crate) fn request_vote_result_to_proto(
    app_result: Result<RequestVoteOutput, RequestVoteError>,
) -> ProtoRequestVoteResult {
    let result = match app_result {
        Ok(ok) => proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
            vote_granted: ok.vote_granted,
        }),
        Err(RequestVoteError::CandidateNotInCluster) => {
            proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess { vote_granted: false })
        }
        Err(RequestVoteError::RequestTermOutOfDate(term_info)) => {
            proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })),
            })
        }
        Err(e) => proto_request_vote_result::Result::Err(ProtoRequestVoteError {
            err: Some(proto_request_vote_error::Err::ServerFault(server_fault(e.to_string()))),
        }),
    };

    ProtoRequestVoteResult { result: Some(result) }
}

pub(crate) fn request_vote_result_from_proto(rpc_reply: Result<ProtoRequestVoteResult, Status>) -> RequestVoteResult {
    match rpc_reply {
        Ok(rpc_result) => match rpc_result.result {
            Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                if success_reply.vote_granted {
                    RequestVoteResult::VoteGranted
                } else {
                    RequestVoteResult::VoteNotGranted
                }
            }
            Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                    RequestVoteResult::RetryableFailure(format!("Explicit server fault: {}", fault.message))
                }
                Some(proto_request_vote_error::Err::StaleTerm(payload)) => RequestVoteResult::StaleTerm {
                    new_term: Term::new(payload.current_term),
                },
                None => RequestVoteResult::RetryableFailure("Malformed RequestVote Err".into()),
            },
            None => RequestVoteResult::RetryableFailure("Malformed RequestVote Result".into()),
        },
        Err(rpc_status) => RequestVoteResult::RetryableFailure(format!(
            "Un-modeled failure from RequestVote RPC call: {:?}",
            rpc_status
        )),
    }
}

// ------- AppendEntries --------

pub(crate) fn append_entries_req_to_proto(input: AppendEntriesInput) -> ProtoAppendEntriesReq {
    let (previous_log_entry_term, previous_log_entry_index) =
        log_entry_metadata_to_proto(input.leader_previous_log_entry);

    ProtoAppendEntriesReq {
        client_node_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        commit_index: input.leader_commit_index.map(|i| i.as_u64()).unwrap_or(0),
        previous_log_entry_term,
        previous_log_entry_index,
        new_entries: input.new_entries.into_iter().map(log_entry_to_proto).collect(),
    }
}

pub(crate) fn append_entries_req_from_proto(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
    let leader_previous_log_entry =
        log_entry_metadata_from_proto(rpc_request.previous_log_entry_term, rpc_request.previous_log_entry_index)?;

    let new_entries = rpc_request
        .new_entries
        .into_iter()
        .map(log_entry_from_proto)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AppendEntriesInput {
        leader_term: Term::new(rpc_request.term),
        leader_id: ReplicaId::new(rpc_request.client_node_id),
        leader_previous_log_entry,
        leader_commit_index: Index::from_u64(rpc_request.commit_index),
        new_entries,
    })
}

pub(crate) fn append_entries_result_to_proto(
    app_result: Result<AppendEntriesOutput, AppendEntriesError>,
) -> ProtoAppendEntriesResult {
    let err = match app_result {
        Ok(_) => {
            return ProtoAppendEntriesResult {
                result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {})),
            }
        }
        Err(AppendEntriesError::ClientNotInCluster) => {
            proto_append_entries_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
        }
        Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
            proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                current_term: term_info.current_term.as_u64(),
            })
        }
        Err(AppendEntriesError::ServerMissingPreviousLogEntry(hint)) => {
            let (conflict_term, conflict_index) = log_entry_metadata_to_proto(hint);
            proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                conflict_term,
                conflict_index,
            })
        }
        Err(e) => proto_append_entries_error::Err::ServerFault(server_fault(e.to_string())),
    };

    ProtoAppendEntriesResult {
        result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
            err: Some(err),
        })),
    }
}

pub(crate) fn append_entries_result_from_proto(
    rpc_reply: Result<ProtoAppendEntriesResult, Status>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    let rpc_result = rpc_reply.map_err(|rpc_status| {
        AppendEntriesReplyFromPeerError::RetryableFailure(format!(
            "Un-modeled failure from AppendEntries RPC call: {:?}",
            rpc_status
        ))
    })?;

    match rpc_result.result {
        Some(proto_append_entries_result::Result::Ok(_)) => Ok(()),
        Some(proto_append_entries_result::Result::Err(err)) => match err.err {
            Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                    "Explicit server fault: {}",
                    payload.message
                )),
            ),
            Some(proto_append_entries_error::Err::StaleTerm(payload)) => {
                Err(AppendEntriesReplyFromPeerError::StaleTerm {
                    new_term: Term::new(payload.current_term),
                })
            }
            Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                // A malformed hint is as good as no hint.
                let hint = log_entry_metadata_from_proto(payload.conflict_term, payload.conflict_index).unwrap_or(None);
                Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry(hint))
            }
            Some(proto_append_entries_error::Err::ClientNotInCluster(_)) => {
                // Retry in case peer is out of date.
                Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Peer doesn't think we're in the cluster".into(),
                ))
            }
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed AppendEntries Err".into(),
            )),
        },
        None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            "Malformed AppendEntries Result".into(),
        )),
    }
}

// ------- InstallSnapshot --------

pub(crate) fn install_snapshot_req_to_proto(input: InstallSnapshotInput) -> ProtoInstallSnapshotReq {
    ProtoInstallSnapshotReq {
        client_node_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        last_included_index: input.metadata.last_included_index.as_u64(),
        last_included_term: input.metadata.last_included_term.as_u64(),
        configuration: Some(configuration_to_proto(&input.metadata.configuration)),
        checksum: input.metadata.checksum,
        total_size: input.metadata.size,
        offset: input.offset,
        data: input.data.to_vec(),
        done: input.done,
    }
}

pub(crate) fn install_snapshot_req_from_proto(
    rpc_request: ProtoInstallSnapshotReq,
) -> Result<InstallSnapshotInput, Status> {
    let last_included_index = Index::from_u64(rpc_request.last_included_index)
        .ok_or_else(|| Status::invalid_argument("Snapshot LastIncludedIndex must be non-0"))?;
    let configuration = rpc_request
        .configuration
        .ok_or_else(|| Status::invalid_argument("Snapshot without configuration"))
        .and_then(configuration_from_proto)?;

    Ok(InstallSnapshotInput {
        leader_term: Term::new(rpc_request.term),
        leader_id: ReplicaId::new(rpc_request.client_node_id),
        metadata: SnapshotMetadata {
            last_included_index,
            last_included_term: Term::new(rpc_request.last_included_term),
            configuration,
            checksum: rpc_request.checksum,
            size: rpc_request.total_size,
        },
        offset: rpc_request.offset,
        data: Bytes::from(rpc_request.data),
        done: rpc_request.done,
    })
}

pub(crate) fn install_snapshot_result_to_proto(
    app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
) -> ProtoInstallSnapshotResult {
    let err = match app_result {
        Ok(_) => {
            return ProtoInstallSnapshotResult {
                result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {})),
            }
        }
        Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
            proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                current_term: term_info.current_term.as_u64(),
            })
        }
        Err(InstallSnapshotError::OffsetMismatch { expected_offset }) => {
            proto_install_snapshot_error::Err::OffsetMismatch(ProtoSnapshotOffsetMismatch { expected_offset })
        }
        Err(e) => proto_install_snapshot_error::Err::ServerFault(server_fault(e.to_string())),
    };

    ProtoInstallSnapshotResult {
        result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
            err: Some(err),
        })),
    }
}

pub(crate) fn install_snapshot_result_from_proto(
    rpc_reply: Result<ProtoInstallSnapshotResult, Status>,
) -> Result<(), InstallSnapshotReplyFromPeerError> {
    let rpc_result = rpc_reply.map_err(|rpc_status| {
        InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
            "Un-modeled failure from InstallSnapshot RPC call: {:?}",
            rpc_status
        ))
    })?;

    match rpc_result.result {
        Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(()),
        Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
            Some(proto_install_snapshot_error::Err::ServerFault(payload)) => {
                Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
                    "Explicit server fault: {}",
                    payload.message
                )))
            }
            Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => {
                Err(InstallSnapshotReplyFromPeerError::StaleTerm {
                    new_term: Term::new(payload.current_term),
                })
            }
            Some(proto_install_snapshot_error::Err::OffsetMismatch(payload)) => {
                Err(InstallSnapshotReplyFromPeerError::OffsetMismatch {
                    expected_offset: payload.expected_offset,
                })
            }
            None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                "Malformed InstallSnapshot Err".into(),
            )),
        },
        None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
            "Malformed InstallSnapshot Result".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{AppendEntriesError, TermOutOfDateInfo};

    fn member(id: &str, port: u16) -> ReplicaMetadata {
        ReplicaMetadata::new(
            ReplicaId::new(id),
            Ipv4Addr::new(10, 0, 0, 7),
            port,
            ReplicaInfoBlob::new(u128::MAX - 5),
        )
    }

    #[test]
    fn append_entries_request_survives_the_wire() {
        let input = AppendEntriesInput {
            leader_term: Term::new(7),
            leader_id: ReplicaId::new("leader"),
            leader_previous_log_entry: Some((Term::new(6), Index::new(41))),
            leader_commit_index: Some(Index::new(40)),
            new_entries: vec![
                WriteAheadLogEntry {
                    term: Term::new(7),
                    payload: EntryPayload::NoOp,
                },
                WriteAheadLogEntry {
                    term: Term::new(7),
                    payload: EntryPayload::Configuration(ClusterConfiguration::joint(
                        vec![member("a", 1)],
                        vec![member("a", 1), member("b", 65535)],
                    )),
                },
                WriteAheadLogEntry {
                    term: Term::new(7),
                    payload: EntryPayload::Command {
                        client_id: "client".into(),
                        call_id: 99,
                        data: Bytes::from_static(b"put x"),
                    },
                },
            ],
        };

        let decoded = append_entries_req_from_proto(append_entries_req_to_proto(input.clone())).unwrap();
        assert_eq!(decoded.leader_term, input.leader_term);
        assert_eq!(decoded.leader_id, input.leader_id);
        assert_eq!(decoded.leader_previous_log_entry, input.leader_previous_log_entry);
        assert_eq!(decoded.leader_commit_index, input.leader_commit_index);
        assert_eq!(decoded.new_entries, input.new_entries);
    }

    #[test]
    fn rejects_malformed_requests() {
        let mut req = append_entries_req_to_proto(AppendEntriesInput {
            leader_term: Term::new(1),
            leader_id: ReplicaId::new("leader"),
            leader_previous_log_entry: None,
            leader_commit_index: None,
            new_entries: Vec::new(),
        });
        req.previous_log_entry_index = 3;
        assert!(append_entries_req_from_proto(req.clone()).is_err());

        req.previous_log_entry_index = 0;
        req.new_entries.push(ProtoLogEntry { term: 1, payload: None });
        assert!(append_entries_req_from_proto(req).is_err());

        let mut member = member_to_proto(&member("a", 1));
        member.info_blob.pop();
        assert!(member_from_proto(member).is_err());
    }

    #[test]
    fn errors_map_to_peer_errors() {
        let stale = append_entries_result_to_proto(Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
            current_term: Term::new(9),
        })));
        assert_eq!(
            append_entries_result_from_proto(Ok(stale)),
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term: Term::new(9) })
        );

        let missing = append_entries_result_to_proto(Err(AppendEntriesError::ServerMissingPreviousLogEntry(Some((
            Term::new(2),
            Index::new(5),
        )))));
        assert_eq!(
            append_entries_result_from_proto(Ok(missing)),
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry(Some((
                Term::new(2),
                Index::new(5)
            ))))
        );

        let halted = append_entries_result_to_proto(Err(AppendEntriesError::Halted));
        assert!(matches!(
            append_entries_result_from_proto(Ok(halted)),
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(_))
        ));

        assert_eq!(
            request_vote_result_from_proto(Ok(request_vote_result_to_proto(Err(
                RequestVoteError::CandidateNotInCluster
            )))),
            RequestVoteResult::VoteNotGranted
        );

        let mismatch = install_snapshot_result_to_proto(Err(InstallSnapshotError::OffsetMismatch {
            expected_offset: 4096,
        }));
        assert_eq!(
            install_snapshot_result_from_proto(Ok(mismatch)),
            Err(InstallSnapshotReplyFromPeerError::OffsetMismatch { expected_offset: 4096 })
        );
    }
}
