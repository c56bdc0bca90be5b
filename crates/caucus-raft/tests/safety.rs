//! Safety-property tests driven through the public message surface.
//!
//! - Log matching: randomized conflicting AppendEntries sequences never leave
//!   two logs agreeing on an entry while disagreeing on its history.
//! - Idempotence: duplicated and reordered deliveries change nothing.
//! - Term monotonicity: no message sequence ever lowers a node's term, and
//!   any newer term forces a step-down.

use caucus_raft::{
    AppendEntriesRequest, InMemoryConnector, InMemoryStore, LogEntry, LogIndex, ManualTimers, Node,
    NodeId, RaftConfig, RequestVoteRequest, RequestVoteResponse, Role, Store, Term,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn follower(id: u64) -> (Node, InMemoryStore) {
    let store = InMemoryStore::new();
    let node = Node::new(
        Box::new(store.clone()),
        ManualTimers::new().timers(),
        Arc::new(InMemoryConnector::new()),
        RaftConfig::default(),
        NodeId(id),
    )
    .unwrap();
    (node, store)
}

fn append(
    term: Term,
    prev_log_index: LogIndex,
    prev_log_term: Term,
    entries: Vec<LogEntry>,
    leader_commit: LogIndex,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: NodeId(99),
        recipient_id: NodeId(1),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    }
}

/// Log matching: wherever two logs hold the same (index, term), every earlier
/// entry must be identical.
fn assert_log_matching(ours: &[LogEntry], theirs: &[LogEntry]) {
    let common = ours
        .iter()
        .filter(|entry| theirs.iter().any(|other| other == *entry))
        .map(|entry| entry.index)
        .max();

    let Some(common) = common else { return };

    for (a, b) in ours
        .iter()
        .zip(theirs.iter())
        .take_while(|(a, _)| a.index <= common)
    {
        assert_eq!(a, b, "histories diverge below a matching entry");
        assert_eq!(a.command, b.command);
    }
}

#[tokio::test]
async fn test_randomized_conflicts_preserve_log_matching() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..25 {
        let (node, store) = follower(1);

        // The "leader side" of the experiment: a log that keeps getting
        // partially rewritten at ever-higher terms.
        let mut leader_log: Vec<LogEntry> = Vec::new();
        let mut term = Term(1);

        for round in 0..12 {
            // Rewrite a random suffix of the leader log in a new term.
            term = term.next();
            let keep = rng.gen_range(0..=leader_log.len());
            leader_log.truncate(keep);
            let grow = rng.gen_range(1..=3);
            for _ in 0..grow {
                let index = LogIndex(leader_log.len() as u64 + 1);
                leader_log.push(LogEntry::new(
                    index,
                    term,
                    format!("round {round} entry {index}"),
                ));
            }

            // Offer the follower a random suffix of it. A mismatched prev is
            // simply rejected; a matching one merges.
            let from = rng.gen_range(0..leader_log.len());
            let prev_log_index = LogIndex(from as u64);
            let prev_log_term = if from == 0 {
                Term(0)
            } else {
                leader_log[from - 1].term
            };

            node.on_append_entries(append(
                term,
                prev_log_index,
                prev_log_term,
                leader_log[from..].to_vec(),
                LogIndex(0),
            ))
            .unwrap();

            assert_log_matching(&store.log(), &leader_log);
        }

        // Full replication from the start always succeeds; the logs must
        // then agree entry for entry.
        node.on_append_entries(append(
            term,
            LogIndex(0),
            Term(0),
            leader_log.clone(),
            LogIndex(0),
        ))
        .unwrap();

        let final_log = store.log();
        assert_eq!(final_log, leader_log);
        for (a, b) in final_log.iter().zip(leader_log.iter()) {
            assert_eq!(a.command, b.command);
        }
    }
}

#[tokio::test]
async fn test_duplicated_deliveries_change_nothing() {
    let (node, store) = follower(1);

    let term = Term(2);
    let mut history = Vec::new();

    // The transport may duplicate: every message arrives twice.
    for index in 1..=6u64 {
        let entry = LogEntry::new(LogIndex(index), term, format!("entry {index}"));
        let message = append(
            term,
            LogIndex(index - 1),
            if index == 1 { Term(0) } else { term },
            vec![entry.clone()],
            LogIndex(index.saturating_sub(1)),
        );
        history.push(entry);
        node.on_append_entries(message.clone()).unwrap();
        node.on_append_entries(message).unwrap();
    }

    assert_eq!(store.log(), history);
    assert_eq!(node.commit_index(), LogIndex(5));
}

#[tokio::test]
async fn test_messages_from_a_deposed_leader_are_inert() {
    let (node, store) = follower(1);

    let old_term = Term(2);
    let mut stale: Vec<AppendEntriesRequest> = Vec::new();
    for index in 1..=5u64 {
        let entry = LogEntry::new(LogIndex(index), old_term, format!("entry {index}"));
        let message = append(
            old_term,
            LogIndex(index - 1),
            if index == 1 { Term(0) } else { old_term },
            vec![entry],
            LogIndex(0),
        );
        node.on_append_entries(message.clone()).unwrap();
        stale.push(message);
    }

    // A new leader takes over at term 3.
    let mut takeover = append(Term(3), LogIndex(5), old_term, Vec::new(), LogIndex(5));
    takeover.leader_id = NodeId(98);
    node.on_append_entries(takeover).unwrap();
    assert_eq!(node.current_term(), Term(3));

    let log_before = store.log();
    let commit_before = node.commit_index();
    assert_eq!(commit_before, LogIndex(5));

    // The old leader's messages straggle in, duplicated and shuffled; every
    // one is rejected on the term check and nothing moves.
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2 {
        let mut replay = stale.clone();
        for i in (1..replay.len()).rev() {
            replay.swap(i, rng.gen_range(0..=i));
        }
        for message in replay {
            node.on_append_entries(message).unwrap();
        }
    }

    assert_eq!(store.log(), log_before);
    assert_eq!(node.commit_index(), commit_before);
}

#[tokio::test]
async fn test_no_message_sequence_lowers_the_term() {
    let mut rng = StdRng::seed_from_u64(42);
    let (node, _store) = follower(1);
    node.add_node_to_cluster(NodeId(2));

    let mut highest = Term(0);
    for _ in 0..200 {
        let term = Term(rng.gen_range(0..8));

        match rng.gen_range(0..4u8) {
            0 => node
                .on_request_vote(RequestVoteRequest {
                    term,
                    candidate_id: NodeId(2),
                    last_log_index: LogIndex(rng.gen_range(0..4)),
                    last_log_term: Term(rng.gen_range(0..4)),
                })
                .unwrap(),
            1 => node
                .on_request_vote_response(RequestVoteResponse {
                    term,
                    candidate_id: NodeId(1),
                    granter_id: NodeId(2),
                    vote_granted: rng.gen_bool(0.5),
                })
                .unwrap(),
            2 => node
                .on_append_entries(append(term, LogIndex(0), Term(0), Vec::new(), LogIndex(0)))
                .unwrap(),
            _ => node
                .on_append_entries_response(caucus_raft::AppendEntriesResponse {
                    term,
                    leader_id: NodeId(1),
                    follower_id: NodeId(2),
                    success: rng.gen_bool(0.5),
                    match_index: LogIndex(rng.gen_range(0..4)),
                })
                .unwrap(),
        }

        let current = node.current_term();
        assert!(current >= highest, "term regressed: {current} < {highest}");
        if term > highest {
            // A strictly newer term must have forced a follower step-down
            // with the vote cleared (unless a vote was granted just now).
            assert_eq!(node.role(), Role::Follower);
        }
        highest = highest.max(current);
    }
}

#[tokio::test]
async fn test_a_vote_is_exclusive_within_a_term() {
    let (node, _store) = follower(1);

    node.on_request_vote(RequestVoteRequest {
        term: Term(3),
        candidate_id: NodeId(2),
        last_log_index: LogIndex(0),
        last_log_term: Term(0),
    })
    .unwrap();
    assert_eq!(node.voted_for(), Some(NodeId(2)));

    // Another candidate in the same term is refused; the vote stands.
    node.on_request_vote(RequestVoteRequest {
        term: Term(3),
        candidate_id: NodeId(3),
        last_log_index: LogIndex(9),
        last_log_term: Term(3),
    })
    .unwrap();
    assert_eq!(node.voted_for(), Some(NodeId(2)));

    // A higher term clears the slate and the better log wins the new vote.
    node.on_request_vote(RequestVoteRequest {
        term: Term(4),
        candidate_id: NodeId(3),
        last_log_index: LogIndex(9),
        last_log_term: Term(3),
    })
    .unwrap();
    assert_eq!(node.voted_for(), Some(NodeId(3)));
    assert_eq!(node.current_term(), Term(4));
}
