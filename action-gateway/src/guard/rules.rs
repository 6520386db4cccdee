use std::cmp::Ordering;
use std::sync::Arc;

use derivative::Derivative;

use crate::error::ValidationError;
use crate::glob::Glob;
use crate::registry::GuardPredicate;

/// A guard declared by an action, applying to every action name its pattern matches.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct GuardRule {
    /// The action that declared the guard.
    pub owner: String,
    pub pattern: Glob,
    /// Name the predicate was registered under.
    pub predicate_name: String,
    #[derivative(Debug = "ignore")]
    pub predicate: Arc<dyn GuardPredicate>,
}

/// Registered guard rules, selected by the most specific matching pattern.
#[derive(Clone, Debug, Default)]
pub struct GuardSet {
    rules: Vec<Arc<GuardRule>>,
}

impl GuardSet {
    /// Adds a rule. Two overlapping patterns of equal specificity could never be told apart
    /// at selection time, so they are rejected here.
    pub fn insert(&mut self, rule: GuardRule) -> Result<(), ValidationError> {
        if let Some(existing) = self.rules.iter().find(|existing| {
            existing.owner != rule.owner
                && existing.pattern.cmp_specificity(&rule.pattern) == Ordering::Equal
                && existing.pattern.overlaps(&rule.pattern)
        }) {
            return Err(ValidationError::new(
                "guard.pattern",
                format!(
                    "'{}' is as specific as '{}' declared by '{}'",
                    rule.pattern, existing.pattern, existing.owner
                ),
            ));
        }
        self.rules.push(Arc::new(rule));
        Ok(())
    }

    /// Removes the rules declared by `owner`.
    pub fn remove_owner(&mut self, owner: &str) {
        self.rules.retain(|rule| rule.owner != owner);
    }

    /// The most specific rule matching `action`.
    pub fn select(&self, action: &str) -> Option<Arc<GuardRule>> {
        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches(action))
            .max_by(|left, right| left.pattern.cmp_specificity(&right.pattern))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
