//! Message-type rules: envelope mutations applied at send time.
//!
//! A [`MessageTypeRule`] pairs a predicate over the message type name with
//! a mutation over the outgoing [`Envelope`]. Unlike error rules, ALL
//! matching rules apply, in registration order, with the attribute phase
//! running before the fluent phase. When two rules write the same header
//! key, the last registered rule wins.

use std::time::Duration;

use crate::envelope::Envelope;

type TypeMatcher = Box<dyn Fn(&str) -> bool + Send + Sync>;
type EnvelopeMutation = Box<dyn Fn(&mut Envelope) + Send + Sync>;

/// Registration phase of a rule.
///
/// Rules discovered from declarative markers on message types register in
/// the `Attribute` phase; rules added through configuration register in
/// the `Fluent` phase. Attribute rules always apply first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePhase {
    Attribute,
    Fluent,
}

/// A predicate over a message type paired with an envelope mutation.
pub struct MessageTypeRule {
    phase: RulePhase,
    matches: TypeMatcher,
    mutate: EnvelopeMutation,
}

impl MessageTypeRule {
    /// Creates a fluent-phase rule from a predicate and a mutation.
    pub fn new(
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        mutate: impl Fn(&mut Envelope) + Send + Sync + 'static,
    ) -> Self {
        Self {
            phase: RulePhase::Fluent,
            matches: Box::new(matches),
            mutate: Box::new(mutate),
        }
    }

    /// Creates a rule matching exactly one message type name.
    pub fn for_type(
        message_type: impl Into<String>,
        mutate: impl Fn(&mut Envelope) + Send + Sync + 'static,
    ) -> Self {
        let message_type = message_type.into();
        Self::new(move |name| name == message_type, mutate)
    }

    /// Creates a rule matching every message type.
    pub fn for_any(mutate: impl Fn(&mut Envelope) + Send + Sync + 'static) -> Self {
        Self::new(|_| true, mutate)
    }

    /// Creates a rule that stamps a delivery window on matching envelopes.
    pub fn deliver_within(message_type: impl Into<String>, window: Duration) -> Self {
        Self::for_type(message_type, move |envelope| {
            envelope.deliver_within(window);
        })
    }

    /// Creates a rule that injects a header on matching envelopes.
    pub fn set_header(
        message_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let value = value.into();
        Self::for_type(message_type, move |envelope| {
            envelope.headers.set(key.clone(), value.clone());
        })
    }

    /// Moves this rule into the attribute phase.
    #[must_use]
    pub fn in_attribute_phase(mut self) -> Self {
        self.phase = RulePhase::Attribute;
        self
    }

    /// This rule's registration phase.
    #[must_use]
    pub fn phase(&self) -> RulePhase {
        self.phase
    }
}

impl std::fmt::Debug for MessageTypeRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTypeRule")
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Ordered registry of message-type rules.
///
/// Kept as two registration-order lists, one per phase, so attribute
/// rules always run before fluent rules without re-sorting on apply.
#[derive(Debug, Default)]
pub struct MessageTypeRules {
    attribute_rules: Vec<MessageTypeRule>,
    fluent_rules: Vec<MessageTypeRule>,
}

impl MessageTypeRules {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule in its declared phase, preserving order.
    pub fn add(&mut self, rule: MessageTypeRule) {
        match rule.phase {
            RulePhase::Attribute => self.attribute_rules.push(rule),
            RulePhase::Fluent => self.fluent_rules.push(rule),
        }
    }

    /// Total number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attribute_rules.len() + self.fluent_rules.len()
    }

    /// Whether no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attribute_rules.is_empty() && self.fluent_rules.is_empty()
    }

    /// Applies every matching rule to the envelope.
    ///
    /// Attribute-phase rules first, then fluent-phase rules, each in
    /// registration order.
    pub fn apply(&self, envelope: &mut Envelope) {
        let mut applied = 0_usize;
        for rule in self.attribute_rules.iter().chain(&self.fluent_rules) {
            if (rule.matches)(&envelope.message_type) {
                (rule.mutate)(envelope);
                applied += 1;
            }
        }
        if applied > 0 {
            tracing::trace!(
                envelope = %envelope.id,
                message_type = %envelope.message_type,
                applied,
                "applied message type rules"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_matching_rules_apply_in_registration_order() {
        let mut rules = MessageTypeRules::new();
        rules.add(MessageTypeRule::set_header("MySpecialMessage", "rule1", "true"));
        rules.add(MessageTypeRule::new(
            |name| name.starts_with("MySpecial"),
            |envelope| envelope.headers.set("rule2", "true"),
        ));

        let mut envelope = Envelope::new("MySpecialMessage", Vec::new());
        rules.apply(&mut envelope);

        assert_eq!(envelope.headers.get("rule1"), Some("true"));
        assert_eq!(envelope.headers.get("rule2"), Some("true"));
    }

    #[test]
    fn non_matching_rules_are_skipped() {
        let mut rules = MessageTypeRules::new();
        rules.add(MessageTypeRule::set_header("OtherMessage", "other", "true"));

        let mut envelope = Envelope::new("MySpecialMessage", Vec::new());
        rules.apply(&mut envelope);

        assert!(envelope.headers.is_empty());
    }

    #[test]
    fn attribute_rules_apply_before_fluent_rules() {
        let mut rules = MessageTypeRules::new();
        // Registered first as fluent, but the attribute rule must win the
        // ordering race despite being registered later.
        rules.add(MessageTypeRule::for_any(|envelope| {
            envelope.headers.set("order", "fluent");
        }));
        rules.add(
            MessageTypeRule::for_any(|envelope| {
                envelope.headers.set("order", "attribute");
            })
            .in_attribute_phase(),
        );

        let mut envelope = Envelope::new("Message1", Vec::new());
        rules.apply(&mut envelope);

        // Fluent ran second, so it wrote last.
        assert_eq!(envelope.headers.get("order"), Some("fluent"));
    }

    #[test]
    fn later_rule_wins_header_conflict() {
        let mut rules = MessageTypeRules::new();
        rules.add(MessageTypeRule::set_header("Message1", "tenant", "first"));
        rules.add(MessageTypeRule::set_header("Message1", "tenant", "second"));

        let mut envelope = Envelope::new("Message1", Vec::new());
        rules.apply(&mut envelope);

        assert_eq!(envelope.headers.get("tenant"), Some("second"));
    }

    #[test]
    fn deliver_within_rule_stamps_deadline_and_headers_coexist() {
        let mut rules = MessageTypeRules::new();
        rules.add(
            MessageTypeRule::set_header("MySpecialMessage", "special", "true")
                .in_attribute_phase(),
        );
        rules.add(MessageTypeRule::deliver_within(
            "MySpecialMessage",
            Duration::from_secs(5),
        ));

        let mut envelope = Envelope::new("MySpecialMessage", Vec::new());
        let before = crate::envelope::now_ms();
        rules.apply(&mut envelope);

        assert_eq!(envelope.headers.get("special"), Some("true"));
        let deadline = envelope.deliver_by.expect("delivery window stamped");
        assert!(deadline >= before + 5_000);
        assert!(deadline <= crate::envelope::now_ms() + 5_000);
    }
}
