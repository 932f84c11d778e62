//! Watch-driven reconcilers built on the kube-runtime controller queue, which
//! never runs the same object concurrently.

use crate::{
    apply::KubeApplier,
    core::{reaper::NamespaceReaper, state::ImportStateMachine, Error},
    hub::KubeHub,
    lease::{Leader, LEASE_DURATION},
    metrics::ControllerMetrics,
};
use kube::runtime::controller::Action;
use std::time::Duration;

pub mod cluster;
pub mod namespace;

pub type StateMachine = ImportStateMachine<KubeHub, KubeHub, KubeHub, KubeHub, KubeHub, KubeApplier>;

/// Backoff after a retryable failure.
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

pub struct Context<T> {
    pub inner: T,
    pub leader: Leader,
    pub metrics: ControllerMetrics,
}

pub type ClusterContext = Context<StateMachine>;
pub type NamespaceContext = Context<NamespaceReaper<KubeHub>>;

/// Followers check back once a lease term has passed.
fn not_leader() -> Action {
    Action::requeue(LEASE_DURATION)
}

fn requeue(after: Option<Duration>) -> Action {
    after.map(Action::requeue).unwrap_or_else(Action::await_change)
}

/// Retryable failures come back after a fixed backoff; the rest wait for the
/// object to change.
fn on_error(error: &Error) -> Action {
    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retryable_errors_requeue() {
        assert_eq!(
            on_error(&Error::Remote(anyhow::anyhow!("conflict"))),
            Action::requeue(ERROR_REQUEUE)
        );
        assert_eq!(on_error(&Error::malformed("bad pem")), Action::await_change());
        assert_eq!(requeue(None), Action::await_change());
        assert_eq!(
            requeue(Some(Duration::from_secs(5))),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
