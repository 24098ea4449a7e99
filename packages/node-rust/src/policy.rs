//! Error policy engine: handler failures to retry decisions.
//!
//! An ordered rule set maps a caught error (and the envelope's attempt
//! count) to an [`ErrorAction`]. First matching rule wins. With no match,
//! the default is requeue until the attempt ceiling, then the error queue.
//! The ceiling applies even when a rule matches: once `attempts` reaches
//! `max_attempts`, every further failure dead-letters.

use std::time::Duration;

use courier_core::Envelope;
use parking_lot::RwLock;

/// What to do with an envelope whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Increment attempts and re-enter the worker queue immediately.
    Requeue,
    /// Increment attempts, defer to `now + delay` via the scheduler.
    RetryAfter(Duration),
    /// Terminal: persist the final error and notify observers.
    MoveToErrorQueue,
    /// Terminal: drop with no persisted failure record.
    Discard,
}

type ErrorMatcher = Box<dyn Fn(&anyhow::Error, u32) -> bool + Send + Sync>;

/// A predicate over a handler error paired with an action.
pub struct ErrorRule {
    matches: ErrorMatcher,
    action: ErrorAction,
}

impl ErrorRule {
    /// Creates a rule from an arbitrary predicate over the error and the
    /// envelope's current attempt count.
    pub fn new(
        matches: impl Fn(&anyhow::Error, u32) -> bool + Send + Sync + 'static,
        action: ErrorAction,
    ) -> Self {
        Self {
            matches: Box::new(matches),
            action,
        }
    }

    /// Creates a rule matching a concrete error type in the chain.
    ///
    /// Matches through `anyhow::Error::is`, so both the outermost error
    /// and its root cause are considered.
    pub fn for_error<E>(action: ErrorAction) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self::new(move |error, _| error.is::<E>(), action)
    }

    /// Creates a rule that fires once the attempt count reaches `attempts`.
    pub fn after_attempts(attempts: u32, action: ErrorAction) -> Self {
        Self::new(move |_, seen| seen >= attempts, action)
    }

    /// The action this rule selects.
    #[must_use]
    pub fn action(&self) -> ErrorAction {
        self.action
    }
}

impl std::fmt::Debug for ErrorRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRule")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Ordered, first-match-wins error rule registry.
///
/// Interior-mutable so registration (&self, before start) and evaluation
/// (from worker tasks) share one instance behind an `Arc`.
#[derive(Debug, Default)]
pub struct ErrorPolicy {
    rules: RwLock<Vec<ErrorRule>>,
}

impl ErrorPolicy {
    /// Creates an empty policy (defaults only).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule. Evaluation order is registration order.
    pub fn add(&self, rule: ErrorRule) {
        self.rules.write().push(rule);
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Decides the fate of a failed envelope.
    ///
    /// The attempt ceiling is checked first: at or past `max_attempts`,
    /// the decision is always the error queue, never another retry.
    #[must_use]
    pub fn decide(&self, error: &anyhow::Error, envelope: &Envelope) -> ErrorAction {
        if envelope.attempts >= envelope.max_attempts {
            return ErrorAction::MoveToErrorQueue;
        }

        for rule in self.rules.read().iter() {
            if (rule.matches)(error, envelope.attempts) {
                return rule.action;
            }
        }

        ErrorAction::Requeue
    }
}

#[cfg(test)]
mod tests {
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    #[error("attempted to divide by zero")]
    struct DivideByZeroError;

    #[derive(Debug, Error)]
    #[error("the operation timed out")]
    struct TimeoutError;

    fn envelope_with_attempts(attempts: u32, max_attempts: u32) -> Envelope {
        let mut envelope = Envelope::new("Message2", Vec::new());
        envelope.attempts = attempts;
        envelope.max_attempts = max_attempts;
        envelope
    }

    #[test]
    fn default_is_requeue_below_ceiling() {
        let policy = ErrorPolicy::new();
        let envelope = envelope_with_attempts(0, 3);
        let action = policy.decide(&anyhow::anyhow!("boom"), &envelope);
        assert_eq!(action, ErrorAction::Requeue);
    }

    #[test]
    fn default_is_error_queue_at_ceiling() {
        let policy = ErrorPolicy::new();
        let envelope = envelope_with_attempts(3, 3);
        let action = policy.decide(&anyhow::anyhow!("boom"), &envelope);
        assert_eq!(action, ErrorAction::MoveToErrorQueue);
    }

    #[test]
    fn typed_rules_match_first_wins() {
        let policy = ErrorPolicy::new();
        policy.add(ErrorRule::for_error::<DivideByZeroError>(ErrorAction::Requeue));
        policy.add(ErrorRule::for_error::<TimeoutError>(ErrorAction::RetryAfter(
            Duration::from_secs(10),
        )));
        // Catch-all registered last never shadows the typed rules.
        policy.add(ErrorRule::new(|_, _| true, ErrorAction::Discard));

        let envelope = envelope_with_attempts(0, 3);

        let action = policy.decide(&anyhow::Error::new(DivideByZeroError), &envelope);
        assert_eq!(action, ErrorAction::Requeue);

        let action = policy.decide(&anyhow::Error::new(TimeoutError), &envelope);
        assert_eq!(action, ErrorAction::RetryAfter(Duration::from_secs(10)));

        let action = policy.decide(&anyhow::anyhow!("anything else"), &envelope);
        assert_eq!(action, ErrorAction::Discard);
    }

    #[test]
    fn matched_rule_still_loses_to_attempt_ceiling() {
        let policy = ErrorPolicy::new();
        policy.add(ErrorRule::for_error::<TimeoutError>(ErrorAction::RetryAfter(
            Duration::from_secs(10),
        )));

        let envelope = envelope_with_attempts(3, 3);
        let action = policy.decide(&anyhow::Error::new(TimeoutError), &envelope);
        assert_eq!(action, ErrorAction::MoveToErrorQueue);
    }

    #[test]
    fn rule_matches_error_in_context_chain() {
        let policy = ErrorPolicy::new();
        policy.add(ErrorRule::for_error::<TimeoutError>(ErrorAction::Requeue));

        let wrapped = anyhow::Error::new(TimeoutError).context("while calling downstream");
        let envelope = envelope_with_attempts(0, 3);
        assert_eq!(policy.decide(&wrapped, &envelope), ErrorAction::Requeue);
    }

    #[test]
    fn attempt_count_rules_see_current_attempts() {
        let policy = ErrorPolicy::new();
        policy.add(ErrorRule::after_attempts(2, ErrorAction::Discard));

        let fresh = envelope_with_attempts(0, 10);
        assert_eq!(policy.decide(&anyhow::anyhow!("x"), &fresh), ErrorAction::Requeue);

        let worn = envelope_with_attempts(2, 10);
        assert_eq!(policy.decide(&anyhow::anyhow!("x"), &worn), ErrorAction::Discard);
    }
}
