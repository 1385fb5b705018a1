//! Immutable rule stores and the context matcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use switchyard_common::{Context, Error, Features, Result, TrackedContexts};

use crate::context::ContextDefaults;
use crate::rule::{Conditions, Rule};

/// The complete rule set of one setting.
///
/// A store is built once and replaced as a whole; it is never mutated after
/// construction.
#[derive(Debug, Clone)]
pub struct RuleStore {
    setting: String,
    features: Features,
    rules: Vec<Rule>,
    tracked: TrackedContexts,
    defaults: Option<Arc<ContextDefaults>>,
    client_id: Option<Uuid>,
}

impl RuleStore {
    /// Build a store scored over `features`.
    ///
    /// Rules addressing a feature outside `features` are dropped. Rules with
    /// identical conditions are kept; the later one wins at lookup.
    pub fn new(setting: impl Into<String>, features: Features, rules: Vec<Rule>) -> Self {
        let setting = setting.into();
        let mut kept = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Some(feature) = rule.conditions.keys().find(|f| !features.contains(f)) {
                warn!(
                    "Discarding rule {:?} for setting '{}': feature '{}' is not in {}",
                    rule.conditions, setting, feature, features
                );
                continue;
            }
            kept.push(rule);
        }

        let mut seen: BTreeMap<&Conditions, usize> = BTreeMap::new();
        for rule in &kept {
            *seen.entry(&rule.conditions).or_default() += 1;
        }
        for (conditions, count) in seen.into_iter().filter(|(_, count)| *count > 1) {
            warn!(
                "Rule conflict for setting '{}': {} rules with conditions {:?}",
                setting, count, conditions
            );
        }

        Self {
            setting,
            features,
            rules: kept,
            tracked: TrackedContexts::default(),
            defaults: None,
            client_id: None,
        }
    }

    /// Record the tracked-context filter the rules were fetched with.
    pub fn with_tracking(mut self, tracked: TrackedContexts) -> Self {
        self.tracked = tracked;
        self
    }

    /// Attach the context defaults of the building client.
    pub fn with_defaults(mut self, defaults: Arc<ContextDefaults>) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn with_client(mut self, client_id: Uuid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn setting(&self) -> &str {
        &self.setting
    }

    /// Effective feature order used for scoring.
    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn tracked(&self) -> &TrackedContexts {
        &self.tracked
    }

    pub fn defaults(&self) -> Option<&Arc<ContextDefaults>> {
        self.defaults.as_ref()
    }

    /// Client that built the store; `None` for locally patched stores.
    pub fn client_id(&self) -> Option<Uuid> {
        self.client_id
    }

    /// Priority score of a rule: the sum of its addressed feature weights.
    pub fn score(&self, rule: &Rule) -> u64 {
        rule.conditions
            .keys()
            .filter_map(|f| self.features.weight(f))
            .sum()
    }

    /// Find the winning rule for a fully merged context.
    ///
    /// Among matching rules the highest score wins; equal scores resolve to
    /// the rule that comes last.
    pub fn resolve(&self, context: &Context) -> Option<&Rule> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matches(context))
            .max_by_key(|(index, rule)| (self.score(rule), *index))
            .map(|(_, rule)| rule)
    }

    /// Merge a lookup context with this store's defaults.
    ///
    /// # Errors
    /// - `Error::MissingContext` if a scored feature has no value
    pub fn merge_context(&self, context: &Context) -> Result<Context> {
        merge_context(&self.setting, &self.features, context, self.defaults.as_deref())
    }
}

/// Restrict `context` to `features`, filling gaps from `defaults`.
///
/// # Errors
/// - `Error::MissingContext` naming every feature without a value
pub fn merge_context(
    setting: &str,
    features: &Features,
    context: &Context,
    defaults: Option<&ContextDefaults>,
) -> Result<Context> {
    let mut merged = Context::new();
    let mut missing = Vec::new();
    for feature in features.iter() {
        let value = context
            .get(feature)
            .map(str::to_string)
            .or_else(|| defaults.and_then(|d| d.resolve(feature)));
        match value {
            Some(value) => merged.insert(feature, value),
            None => missing.push(feature),
        }
    }
    if !missing.is_empty() {
        return Err(Error::MissingContext(format!(
            "Setting '{}' requires context features [{}]",
            setting,
            missing.join(", ")
        )));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleSource;
    use proptest::prelude::*;
    use switchyard_schema::Value;

    fn rule(pairs: &[(&str, &str)], value: i64) -> Rule {
        Rule::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            serde_json::json!(value),
            Value::Int(value),
            RuleSource::Server { rule_id: None },
        )
    }

    fn abc() -> Features {
        Features::new(["a", "b", "c"]).unwrap()
    }

    #[test]
    fn test_highest_feature_outranks_rest() {
        let store = RuleStore::new(
            "s",
            abc(),
            vec![
                rule(&[("b", "1"), ("c", "1")], 1),
                rule(&[("a", "1")], 2),
                rule(&[], 3),
            ],
        );
        let ctx = Context::from([("a", "1"), ("b", "1"), ("c", "1")]);
        assert_eq!(store.resolve(&ctx).unwrap().value, Value::Int(2));

        let ctx = Context::from([("a", "0"), ("b", "1"), ("c", "1")]);
        assert_eq!(store.resolve(&ctx).unwrap().value, Value::Int(1));

        let ctx = Context::from([("a", "0"), ("b", "0"), ("c", "0")]);
        assert_eq!(store.resolve(&ctx).unwrap().value, Value::Int(3));
    }

    #[test]
    fn test_tie_resolves_to_latest() {
        let store = RuleStore::new(
            "s",
            abc(),
            vec![rule(&[("a", "1")], 1), rule(&[("a", "1")], 2)],
        );
        let ctx = Context::from([("a", "1"), ("b", "x"), ("c", "x")]);
        assert_eq!(store.resolve(&ctx).unwrap().value, Value::Int(2));
    }

    #[test]
    fn test_out_of_set_rules_are_dropped() {
        let features = Features::new(["a", "b"]).unwrap();
        let store = RuleStore::new(
            "s",
            features,
            vec![rule(&[("c", "1")], 1), rule(&[("a", "1")], 2)],
        );
        assert_eq!(store.rules().len(), 1);
        assert_eq!(store.rules()[0].value, Value::Int(2));
    }

    #[test]
    fn test_merge_context() {
        let defaults = Arc::new(ContextDefaults::new());
        defaults.set("b", "from-default").unwrap();
        let store = RuleStore::new("s", abc(), Vec::new()).with_defaults(defaults);

        let merged = store
            .merge_context(&Context::from([("a", "1"), ("c", "3"), ("z", "ignored")]))
            .unwrap();
        assert_eq!(merged.get("b"), Some("from-default"));
        assert_eq!(merged.get("z"), None);

        let err = store.merge_context(&Context::from([("a", "1")])).unwrap_err();
        assert!(matches!(err, Error::MissingContext(ref msg) if msg.contains('c')));
    }

    #[test]
    fn test_explicit_context_beats_default() {
        let defaults = Arc::new(ContextDefaults::new());
        defaults.set("a", "0").unwrap();
        let store = RuleStore::new("s", Features::new(["a"]).unwrap(), vec![rule(&[("a", "1")], 9)])
            .with_defaults(defaults);

        let merged = store.merge_context(&Context::from([("a", "1")])).unwrap();
        assert_eq!(store.resolve(&merged).unwrap().value, Value::Int(9));
        let merged = store.merge_context(&Context::new()).unwrap();
        assert!(store.resolve(&merged).is_none());
    }

    fn conditions() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["a", "b", "c", "d"]),
                prop::sample::select(vec!["0", "1"]),
            ),
            0..4,
        )
        .prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_winner_addresses_highest_features(
            rule_conditions in prop::collection::vec(conditions(), 0..12),
            values in prop::collection::vec(prop::sample::select(vec!["0", "1"]), 4),
        ) {
            let features = Features::new(["a", "b", "c", "d"]).unwrap();
            let rules: Vec<Rule> = rule_conditions
                .iter()
                .enumerate()
                .map(|(i, pairs)| {
                    let pairs: Vec<(&str, &str)> =
                        pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                    rule(&pairs, i as i64)
                })
                .collect();
            let store = RuleStore::new("s", features.clone(), rules);
            let ctx: Context = features.iter().zip(values.iter().copied()).collect();

            let addressed = |rule: &Rule| -> Vec<bool> {
                features.iter().map(|f| rule.conditions.contains_key(f)).collect()
            };

            match store.resolve(&ctx) {
                None => prop_assert!(store.rules().iter().all(|r| !r.matches(&ctx))),
                Some(winner) => {
                    prop_assert!(winner.matches(&ctx));
                    for other in store.rules().iter().filter(|r| r.matches(&ctx)) {
                        prop_assert!(addressed(winner) >= addressed(other));
                    }
                    // Deterministic across repeated lookups.
                    prop_assert_eq!(store.resolve(&ctx), Some(winner));
                }
            }
        }
    }
}
