use dashmap::DashMap;
use regex::Regex;

use relaybot_core::types::{Trigger, TriggerMatchType, TriggerScope};

/// Compiled-pattern cache for REGEX triggers. Patterns are validated (length
/// and compilability) at trigger-creation time, so a lookup miss here only
/// means "not cached yet", never "invalid".
#[derive(Default)]
pub struct TriggerMatcher {
    regex_cache: DashMap<String, Regex>,
}

impl TriggerMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `from_me` is the scope guard from spec.md §4.7: outgoing messages only
    /// match OUTGOING/BOTH triggers, incoming only INCOMING/BOTH.
    pub fn matches(&self, trigger: &Trigger, content: &str, from_me: bool) -> bool {
        let scope_ok = match trigger.scope {
            TriggerScope::Incoming => !from_me,
            TriggerScope::Outgoing => from_me,
            TriggerScope::Both => true,
        };
        if !scope_ok {
            return false;
        }

        match trigger.match_type {
            TriggerMatchType::Contains => content.contains(&trigger.keyword),
            TriggerMatchType::Equals => content == trigger.keyword,
            TriggerMatchType::StartsWith => content.starts_with(&trigger.keyword),
            TriggerMatchType::Regex => self.regex_matches(&trigger.keyword, content),
        }
    }

    fn regex_matches(&self, pattern: &str, content: &str) -> bool {
        if let Some(re) = self.regex_cache.get(pattern) {
            return re.is_match(content);
        }
        match Regex::new(pattern) {
            Ok(re) => {
                let hit = re.is_match(content);
                self.regex_cache.insert(pattern.to_string(), re);
                hit
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(match_type: TriggerMatchType, scope: TriggerScope, keyword: &str) -> Trigger {
        Trigger {
            id: "t1".into(),
            bot_id: "b1".into(),
            flow_id: "f1".into(),
            keyword: keyword.into(),
            match_type,
            scope,
        }
    }

    #[test]
    fn contains_match() {
        let m = TriggerMatcher::new();
        let t = trigger(TriggerMatchType::Contains, TriggerScope::Incoming, "hola");
        assert!(m.matches(&t, "dice hola mundo", false));
        assert!(!m.matches(&t, "adios", false));
    }

    #[test]
    fn outgoing_scope_guard_blocks_incoming_messages() {
        let m = TriggerMatcher::new();
        let t = trigger(TriggerMatchType::Contains, TriggerScope::Outgoing, "hola");
        assert!(!m.matches(&t, "hola", false));
        assert!(m.matches(&t, "hola", true));
    }

    #[test]
    fn regex_match_is_cached_after_first_use() {
        let m = TriggerMatcher::new();
        let t = trigger(TriggerMatchType::Regex, TriggerScope::Both, r"^\d{4}$");
        assert!(m.matches(&t, "1234", false));
        assert!(!m.matches(&t, "12a4", false));
        assert_eq!(m.regex_cache.len(), 1);
    }
}
