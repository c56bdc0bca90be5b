//! Message transport seam between nodes.
//!
//! A node registers one handler per message type under its own ID and sends
//! through four verbs: broadcast a vote request, unicast a heartbeat, and
//! unicast either reply. The connector owns delivery; the node never learns
//! how messages travel.

use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler invoked with an inbound message.
pub type MessageHandler<M> = Arc<dyn Fn(M) + Send + Sync>;

/// Transport seam consumed by the node.
pub trait Connector: Send + Sync {
    fn register_append_entries(&self, node_id: NodeId, handler: MessageHandler<AppendEntriesRequest>);
    fn register_append_entries_response(
        &self,
        node_id: NodeId,
        handler: MessageHandler<AppendEntriesResponse>,
    );
    fn register_request_vote(&self, node_id: NodeId, handler: MessageHandler<RequestVoteRequest>);
    fn register_request_vote_response(
        &self,
        node_id: NodeId,
        handler: MessageHandler<RequestVoteResponse>,
    );

    fn deregister_append_entries(&self, node_id: NodeId);
    fn deregister_append_entries_response(&self, node_id: NodeId);
    fn deregister_request_vote(&self, node_id: NodeId);
    fn deregister_request_vote_response(&self, node_id: NodeId);

    /// Broadcast a vote request to every node other than the candidate.
    fn request_votes(&self, message: RequestVoteRequest);

    /// Unicast an AppendEntries to its named recipient.
    fn send_heartbeat(&self, message: AppendEntriesRequest);

    /// Unicast a reply back to the leader that sent the AppendEntries.
    fn reply_append_entries(&self, message: AppendEntriesResponse);

    /// Unicast a reply back to the candidate that requested the vote.
    fn reply_request_vote(&self, message: RequestVoteResponse);
}

#[derive(Default)]
struct Registry {
    append_entries: HashMap<NodeId, Vec<MessageHandler<AppendEntriesRequest>>>,
    append_entries_responses: HashMap<NodeId, Vec<MessageHandler<AppendEntriesResponse>>>,
    request_votes: HashMap<NodeId, Vec<MessageHandler<RequestVoteRequest>>>,
    request_vote_responses: HashMap<NodeId, Vec<MessageHandler<RequestVoteResponse>>>,
}

/// In-process connector delivering synchronously to registered handlers.
///
/// Shared by every node in the process; each node only touches its own
/// registration entries. Handler lists are cloned out of the registry before
/// invocation, so a handler is free to send further messages through the same
/// connector while it runs.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    registry: Arc<Mutex<Registry>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers_for<M>(
        map: &HashMap<NodeId, Vec<MessageHandler<M>>>,
        node_id: NodeId,
    ) -> Vec<MessageHandler<M>> {
        map.get(&node_id).cloned().unwrap_or_default()
    }

    fn handlers_except<M>(
        map: &HashMap<NodeId, Vec<MessageHandler<M>>>,
        excluded: NodeId,
    ) -> Vec<MessageHandler<M>> {
        map.iter()
            .filter(|(&node_id, _)| node_id != excluded)
            .flat_map(|(_, handlers)| handlers.iter().cloned())
            .collect()
    }
}

impl Connector for InMemoryConnector {
    fn register_append_entries(
        &self,
        node_id: NodeId,
        handler: MessageHandler<AppendEntriesRequest>,
    ) {
        self.registry
            .lock()
            .append_entries
            .entry(node_id)
            .or_default()
            .push(handler);
    }

    fn register_append_entries_response(
        &self,
        node_id: NodeId,
        handler: MessageHandler<AppendEntriesResponse>,
    ) {
        self.registry
            .lock()
            .append_entries_responses
            .entry(node_id)
            .or_default()
            .push(handler);
    }

    fn register_request_vote(&self, node_id: NodeId, handler: MessageHandler<RequestVoteRequest>) {
        self.registry
            .lock()
            .request_votes
            .entry(node_id)
            .or_default()
            .push(handler);
    }

    fn register_request_vote_response(
        &self,
        node_id: NodeId,
        handler: MessageHandler<RequestVoteResponse>,
    ) {
        self.registry
            .lock()
            .request_vote_responses
            .entry(node_id)
            .or_default()
            .push(handler);
    }

    fn deregister_append_entries(&self, node_id: NodeId) {
        self.registry.lock().append_entries.remove(&node_id);
    }

    fn deregister_append_entries_response(&self, node_id: NodeId) {
        self.registry
            .lock()
            .append_entries_responses
            .remove(&node_id);
    }

    fn deregister_request_vote(&self, node_id: NodeId) {
        self.registry.lock().request_votes.remove(&node_id);
    }

    fn deregister_request_vote_response(&self, node_id: NodeId) {
        self.registry.lock().request_vote_responses.remove(&node_id);
    }

    fn request_votes(&self, message: RequestVoteRequest) {
        let handlers = {
            let registry = self.registry.lock();
            Self::handlers_except(&registry.request_votes, message.candidate_id)
        };
        for handler in handlers {
            handler(message.clone());
        }
    }

    fn send_heartbeat(&self, message: AppendEntriesRequest) {
        let handlers = {
            let registry = self.registry.lock();
            Self::handlers_for(&registry.append_entries, message.recipient_id)
        };
        for handler in handlers {
            handler(message.clone());
        }
    }

    fn reply_append_entries(&self, message: AppendEntriesResponse) {
        let handlers = {
            let registry = self.registry.lock();
            Self::handlers_for(&registry.append_entries_responses, message.leader_id)
        };
        for handler in handlers {
            handler(message.clone());
        }
    }

    fn reply_request_vote(&self, message: RequestVoteResponse) {
        let handlers = {
            let registry = self.registry.lock();
            Self::handlers_for(&registry.request_vote_responses, message.candidate_id)
        };
        for handler in handlers {
            handler(message.clone());
        }
    }
}

/// Decorator that traces every outbound message before forwarding.
pub struct LoggingConnector {
    inner: Arc<dyn Connector>,
}

impl LoggingConnector {
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self { inner }
    }
}

impl Connector for LoggingConnector {
    fn register_append_entries(
        &self,
        node_id: NodeId,
        handler: MessageHandler<AppendEntriesRequest>,
    ) {
        self.inner.register_append_entries(node_id, handler);
    }

    fn register_append_entries_response(
        &self,
        node_id: NodeId,
        handler: MessageHandler<AppendEntriesResponse>,
    ) {
        self.inner.register_append_entries_response(node_id, handler);
    }

    fn register_request_vote(&self, node_id: NodeId, handler: MessageHandler<RequestVoteRequest>) {
        self.inner.register_request_vote(node_id, handler);
    }

    fn register_request_vote_response(
        &self,
        node_id: NodeId,
        handler: MessageHandler<RequestVoteResponse>,
    ) {
        self.inner.register_request_vote_response(node_id, handler);
    }

    fn deregister_append_entries(&self, node_id: NodeId) {
        self.inner.deregister_append_entries(node_id);
    }

    fn deregister_append_entries_response(&self, node_id: NodeId) {
        self.inner.deregister_append_entries_response(node_id);
    }

    fn deregister_request_vote(&self, node_id: NodeId) {
        self.inner.deregister_request_vote(node_id);
    }

    fn deregister_request_vote_response(&self, node_id: NodeId) {
        self.inner.deregister_request_vote_response(node_id);
    }

    fn request_votes(&self, message: RequestVoteRequest) {
        tracing::debug!(
            candidate = %message.candidate_id,
            term = %message.term,
            "broadcasting RequestVote"
        );
        self.inner.request_votes(message);
    }

    fn send_heartbeat(&self, message: AppendEntriesRequest) {
        tracing::debug!(
            leader = %message.leader_id,
            recipient = %message.recipient_id,
            term = %message.term,
            entries = message.entries.len(),
            "sending AppendEntries"
        );
        self.inner.send_heartbeat(message);
    }

    fn reply_append_entries(&self, message: AppendEntriesResponse) {
        tracing::debug!(
            follower = %message.follower_id,
            leader = %message.leader_id,
            success = message.success,
            "replying to AppendEntries"
        );
        self.inner.reply_append_entries(message);
    }

    fn reply_request_vote(&self, message: RequestVoteResponse) {
        tracing::debug!(
            granter = %message.granter_id,
            candidate = %message.candidate_id,
            granted = message.vote_granted,
            "replying to RequestVote"
        );
        self.inner.reply_request_vote(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogIndex, Term};
    use parking_lot::Mutex;

    fn recording<M: Send + 'static>() -> (Arc<Mutex<Vec<M>>>, MessageHandler<M>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let handler: MessageHandler<M> = Arc::new(move |message| captured.lock().push(message));
        (seen, handler)
    }

    fn vote_request(candidate: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term(1),
            candidate_id: NodeId(candidate),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        }
    }

    #[test]
    fn test_broadcast_skips_the_candidate() {
        let connector = InMemoryConnector::new();
        let (seen_one, handler_one) = recording();
        let (seen_two, handler_two) = recording();

        connector.register_request_vote(NodeId(1), handler_one);
        connector.register_request_vote(NodeId(2), handler_two);

        connector.request_votes(vote_request(1));

        assert!(seen_one.lock().is_empty());
        assert_eq!(seen_two.lock().len(), 1);
    }

    #[test]
    fn test_heartbeat_is_unicast_to_the_recipient() {
        let connector = InMemoryConnector::new();
        let (seen_two, handler_two) = recording();
        let (seen_three, handler_three) = recording();

        connector.register_append_entries(NodeId(2), handler_two);
        connector.register_append_entries(NodeId(3), handler_three);

        connector.send_heartbeat(AppendEntriesRequest {
            term: Term(1),
            leader_id: NodeId(1),
            recipient_id: NodeId(2),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: Vec::new(),
            leader_commit: LogIndex::ZERO,
        });

        assert_eq!(seen_two.lock().len(), 1);
        assert!(seen_three.lock().is_empty());
    }

    #[test]
    fn test_replies_route_to_their_originators() {
        let connector = InMemoryConnector::new();
        let (votes_seen, vote_handler) = recording();
        let (appends_seen, append_handler) = recording();

        connector.register_request_vote_response(NodeId(1), vote_handler);
        connector.register_append_entries_response(NodeId(1), append_handler);

        connector.reply_request_vote(RequestVoteResponse {
            term: Term(1),
            candidate_id: NodeId(1),
            granter_id: NodeId(2),
            vote_granted: true,
        });
        connector.reply_append_entries(AppendEntriesResponse {
            term: Term(1),
            leader_id: NodeId(1),
            follower_id: NodeId(2),
            success: true,
            match_index: LogIndex(1),
        });

        assert_eq!(votes_seen.lock().len(), 1);
        assert_eq!(appends_seen.lock().len(), 1);
    }

    #[test]
    fn test_deregistered_nodes_receive_nothing() {
        let connector = InMemoryConnector::new();
        let (seen, handler) = recording();

        connector.register_request_vote(NodeId(2), handler);
        connector.deregister_request_vote(NodeId(2));

        connector.request_votes(vote_request(1));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_a_handler_may_send_through_the_same_connector() {
        let connector = InMemoryConnector::new();
        let (replies_seen, reply_handler) = recording();
        connector.register_request_vote_response(NodeId(1), reply_handler);

        let nested = connector.clone();
        connector.register_request_vote(
            NodeId(2),
            Arc::new(move |message: RequestVoteRequest| {
                nested.reply_request_vote(RequestVoteResponse {
                    term: message.term,
                    candidate_id: message.candidate_id,
                    granter_id: NodeId(2),
                    vote_granted: true,
                });
            }),
        );

        connector.request_votes(vote_request(1));
        assert_eq!(replies_seen.lock().len(), 1);
    }

    #[test]
    fn test_logging_connector_forwards() {
        let inner = Arc::new(InMemoryConnector::new());
        let logging = LoggingConnector::new(inner.clone());

        let (seen, handler) = recording();
        logging.register_request_vote(NodeId(2), handler);

        logging.request_votes(vote_request(1));
        assert_eq!(seen.lock().len(), 1);
    }
}
