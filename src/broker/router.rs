//! Command forwarding and reply correlation
//!
//! Forwarded commands are written verbatim to the target agent plus a
//! broker-assigned correlation id; the pending table maps each correlation
//! back to the originating manager. Entries leave the table on reply,
//! deadline expiry, or target death — whichever happens first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::broker::connection::ConnectionRegistry;
use crate::domain_types::{CommandName, CommandTimeoutSecs, ConnectionId, CorrelationId};
use crate::protocol::{
    CommandSpec, ErrorCode, Frame, ForwardStatus, ResponseEnvelope,
};
use crate::time_provider::SharedTimeProvider;

/// An in-flight forwarded command awaiting its reply
#[derive(Debug, Clone)]
pub struct PendingCorrelation {
    pub manager: ConnectionId,
    pub target: ConnectionId,
    pub command: CommandName,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Routes forwarded commands and correlates their replies
pub struct CommandRouter {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<CorrelationId, PendingCorrelation>,
    default_timeout: CommandTimeoutSecs,
    time: SharedTimeProvider,
}

impl CommandRouter {
    /// Creates a router over the given connection registry
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        default_timeout: CommandTimeoutSecs,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            default_timeout,
            time,
        }
    }

    /// Forwards a command toward `target`, returning the ack for the sender
    ///
    /// The ack always carries the correlation id so the manager can pair the
    /// eventual `command_result` even when forwarding failed.
    pub fn forward(
        &self,
        manager: ConnectionId,
        target: ConnectionId,
        spec: CommandSpec,
        timeout_secs: Option<u64>,
    ) -> Frame {
        let correlation_id = CorrelationId::generate();
        let timeout = timeout_secs.unwrap_or_else(|| self.default_timeout.as_u64());

        let command_frame = Frame::Command {
            command: spec.command.clone(),
            params: spec.params.clone(),
            command_id: spec.command_id.clone(),
            correlation_id,
            timeout_secs: Some(timeout),
        };

        if self.registry.enqueue(target, command_frame).is_err() {
            debug!(%target, command = %spec.command, "forward to unknown or dead target");
            return Frame::ForwardAck {
                status: ForwardStatus::NoSuchTarget,
                correlation_id,
            };
        }

        let now = self.time.now_utc();
        self.pending.insert(
            correlation_id,
            PendingCorrelation {
                manager,
                target,
                command: spec.command.clone(),
                issued_at: now,
                deadline: now + chrono::Duration::seconds(timeout as i64),
            },
        );
        debug!(
            %manager,
            %target,
            command = %spec.command,
            correlation = %correlation_id,
            timeout,
            "command forwarded"
        );
        Frame::ForwardAck {
            status: ForwardStatus::Queued,
            correlation_id,
        }
    }

    /// Relays a handler result back to its originating manager
    ///
    /// Replies with no matching pending entry (late arrivals after expiry,
    /// or duplicates) are dropped.
    pub fn on_command_result(
        &self,
        from: ConnectionId,
        correlation_id: CorrelationId,
        result: ResponseEnvelope,
    ) {
        {
            let Some(entry) = self.pending.get(&correlation_id) else {
                debug!(correlation = %correlation_id, %from, "dropping unmatched command result");
                return;
            };
            if entry.value().target != from {
                warn!(
                    correlation = %correlation_id,
                    expected = %entry.value().target,
                    actual = %from,
                    "command result from unexpected connection, dropping"
                );
                return;
            }
        }
        if let Some((_, pending)) = self.pending.remove(&correlation_id) {
            self.deliver(&pending, correlation_id, result);
        }
    }

    /// Fails every pending entry targeting a connection that just died
    pub fn fail_pending_for_target(&self, target: ConnectionId) {
        let dead: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().target == target)
            .map(|entry| *entry.key())
            .collect();
        for correlation_id in dead {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                info!(
                    correlation = %correlation_id,
                    %target,
                    command = %pending.command,
                    "target died before replying"
                );
                let envelope = ResponseEnvelope::failure(
                    ErrorCode::TargetDead,
                    "TargetDead",
                    format!("agent {target} disconnected before replying"),
                );
                self.deliver(&pending, correlation_id, envelope);
            }
        }
    }

    /// Drops pending entries whose originating manager is gone
    pub fn drop_pending_for_manager(&self, manager: ConnectionId) {
        self.pending.retain(|_, pending| pending.manager != manager);
    }

    /// Expires entries past their forwarding deadline
    pub fn expire_deadlines(&self) {
        let now = self.time.now_utc();
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for correlation_id in expired {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                info!(
                    correlation = %correlation_id,
                    command = %pending.command,
                    "forwarding deadline expired"
                );
                let envelope = ResponseEnvelope::failure(
                    ErrorCode::Timeout,
                    "ForwardTimeout",
                    format!(
                        "no reply from {} for {} before the forwarding deadline",
                        pending.target, pending.command
                    ),
                );
                self.deliver(&pending, correlation_id, envelope);
            }
        }
    }

    /// Number of in-flight correlations
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn deliver(
        &self,
        pending: &PendingCorrelation,
        correlation_id: CorrelationId,
        result: ResponseEnvelope,
    ) {
        let frame = Frame::CommandResult {
            correlation_id,
            from_client: Some(pending.target),
            result,
        };
        if self.registry.enqueue(pending.manager, frame).is_err() {
            warn!(
                manager = %pending.manager,
                correlation = %correlation_id,
                "originating manager gone, dropping reply"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::Registration;
    use crate::domain_types::QueueCapacity;
    use crate::protocol::{CapabilitySet, Role};
    use crate::time_provider::MockTimeProvider;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        router: CommandRouter,
        clock: Arc<MockTimeProvider>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(MockTimeProvider::new());
        let registry = Arc::new(ConnectionRegistry::new(
            QueueCapacity::default(),
            clock.clone(),
        ));
        let router = CommandRouter::new(
            Arc::clone(&registry),
            CommandTimeoutSecs::default(),
            clock.clone(),
        );
        Fixture {
            registry,
            router,
            clock,
        }
    }

    fn register(
        fixture: &Fixture,
        role: Role,
    ) -> (ConnectionId, tokio::sync::mpsc::Receiver<Frame>) {
        let (handle, rx) = fixture.registry.register(Registration {
            role,
            user_session: "test".to_string(),
            capabilities: CapabilitySet::new(),
            client_start_time: None,
            remote_addr: None,
        });
        (handle.id, rx)
    }

    fn spec(name: &str) -> CommandSpec {
        CommandSpec::new(CommandName::try_new(name).unwrap(), Some(json!({})))
    }

    #[tokio::test]
    async fn forward_reaches_target_and_reply_reaches_manager() {
        let fx = fixture();
        let (manager, mut manager_rx) = register(&fx, Role::Manager);
        let (agent, mut agent_rx) = register(&fx, Role::Agent);

        let ack = fx.router.forward(manager, agent, spec("get_windows"), None);
        let Frame::ForwardAck {
            status,
            correlation_id,
        } = ack
        else {
            panic!("expected forward ack");
        };
        assert_eq!(status, ForwardStatus::Queued);

        // The agent sees the command with the broker's correlation id
        let Frame::Command {
            command,
            correlation_id: relayed,
            ..
        } = agent_rx.recv().await.unwrap()
        else {
            panic!("expected command frame");
        };
        assert_eq!(command.as_ref(), "get_windows");
        assert_eq!(relayed, correlation_id);

        // The agent replies; the manager receives it tagged with from_client
        fx.router.on_command_result(
            agent,
            correlation_id,
            ResponseEnvelope::success(json!({"windows": []})),
        );
        let Frame::CommandResult {
            correlation_id: replied,
            from_client,
            result,
        } = manager_rx.recv().await.unwrap()
        else {
            panic!("expected command result");
        };
        assert_eq!(replied, correlation_id);
        assert_eq!(from_client, Some(agent));
        assert!(result.success);
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[tokio::test]
    async fn forward_to_unknown_target_acks_no_such_target() {
        let fx = fixture();
        let (manager, _manager_rx) = register(&fx, Role::Manager);
        let ack = fx
            .router
            .forward(manager, ConnectionId::new(999), spec("ping"), None);
        assert!(matches!(
            ack,
            Frame::ForwardAck {
                status: ForwardStatus::NoSuchTarget,
                ..
            }
        ));
        // Never enqueued, so it can never surface as TARGET_DEAD later
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[tokio::test]
    async fn dead_target_fails_pending_with_target_dead() {
        let fx = fixture();
        let (manager, mut manager_rx) = register(&fx, Role::Manager);
        let (agent, _agent_rx) = register(&fx, Role::Agent);

        fx.router.forward(manager, agent, spec("slow_op"), None);
        fx.registry.remove(agent);
        fx.router.fail_pending_for_target(agent);

        let Frame::CommandResult { result, .. } = manager_rx.recv().await.unwrap() else {
            panic!("expected command result");
        };
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, Some(ErrorCode::TargetDead));
        assert_eq!(fx.router.pending_count(), 0);
    }

    #[tokio::test]
    async fn deadline_expiry_returns_timeout() {
        let fx = fixture();
        let (manager, mut manager_rx) = register(&fx, Role::Manager);
        let (agent, _agent_rx) = register(&fx, Role::Agent);

        fx.router.forward(manager, agent, spec("slow_op"), Some(5));
        fx.clock.advance(Duration::from_secs(6));
        fx.router.expire_deadlines();

        let Frame::CommandResult { result, .. } = manager_rx.recv().await.unwrap() else {
            panic!("expected command result");
        };
        assert_eq!(result.error.unwrap().code, Some(ErrorCode::Timeout));

        // A late reply after expiry is dropped silently
        fx.router.on_command_result(
            agent,
            CorrelationId::generate(),
            ResponseEnvelope::success(json!({})),
        );
        assert!(manager_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn result_from_wrong_connection_is_dropped() {
        let fx = fixture();
        let (manager, mut manager_rx) = register(&fx, Role::Manager);
        let (agent, mut agent_rx) = register(&fx, Role::Agent);
        let (imposter, _imposter_rx) = register(&fx, Role::Agent);

        fx.router.forward(manager, agent, spec("get_windows"), None);
        let Frame::Command { correlation_id, .. } = agent_rx.recv().await.unwrap() else {
            panic!("expected command frame");
        };

        fx.router.on_command_result(
            imposter,
            correlation_id,
            ResponseEnvelope::success(json!({})),
        );
        assert!(manager_rx.try_recv().is_err());
    }
}
