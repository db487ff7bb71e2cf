//! MQTT topic-name and topic-filter rules (MQTT v3.1.1 §4.7)

use thiserror::Error;

/// Longest topic string the wire format can carry.
pub const MAX_TOPIC_LENGTH: usize = u16::MAX as usize;

/// Whether `topic` is matched by subscription `filter`.
///
/// `+` matches exactly one level, `#` matches the remaining levels (including
/// none) and is only honoured as the final level. Topics beginning with `$`
/// are not matched by a wildcard in the first level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter.is_empty() || topic.is_empty() {
        return false;
    }
    if filter == topic {
        return true;
    }

    let system_topic = topic.starts_with('$');
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    let mut first_level = true;

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => {
                return filter_levels.next().is_none() && !(first_level && system_topic);
            }
            (Some("+"), Some(_)) => {
                if first_level && system_topic {
                    return false;
                }
            }
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
        first_level = false;
    }
}

/// Topic validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,
    #[error("topic is {0} bytes, limit is 65535")]
    TooLong(usize),
    #[error("topic contains a NUL character")]
    NulCharacter,
    #[error("wildcard '{0}' not allowed in a topic name")]
    WildcardInName(char),
    #[error("'#' must be the last level of a filter and stand alone")]
    MisplacedMultiLevelWildcard,
    #[error("'+' must occupy a whole filter level")]
    MisplacedSingleLevelWildcard,
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic name used for PUBLISH.
pub fn validate_topic_name(name: &str) -> Result<(), TopicError> {
    check_common(name)?;
    if let Some(wildcard) = name.chars().find(|c| *c == '+' || *c == '#') {
        return Err(TopicError::WildcardInName(wildcard));
    }
    Ok(())
}

/// Validate a topic filter used for SUBSCRIBE / UNSUBSCRIBE.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(TopicError::MisplacedMultiLevelWildcard);
        }
        if level.contains('+') && level != "+" {
            return Err(TopicError::MisplacedSingleLevelWildcard);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn topic_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9]{1,4}", 1..6).prop_map(|levels| levels.join("/"))
    }

    proptest! {
        #[test]
        fn matching_is_deterministic(filter in "[a-z+#/]{0,12}", topic in "[a-z/$]{0,12}") {
            prop_assert_eq!(topic_matches(&filter, &topic), topic_matches(&filter, &topic));
        }

        #[test]
        fn hash_matches_any_plain_topic(topic in topic_strategy()) {
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn topic_matches_itself(topic in topic_strategy()) {
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn plus_substitution_matches(topic in topic_strategy(), index in 0usize..6) {
            let mut levels: Vec<&str> = topic.split('/').collect();
            let slot = index % levels.len();
            levels[slot] = "+";
            let filter = levels.join("/");
            prop_assert!(topic_matches(&filter, &topic));
        }

        #[test]
        fn extra_level_never_matches_plus_filter(topic in topic_strategy()) {
            let filter: Vec<&str> = topic.split('/').map(|_| "+").collect();
            let longer = format!("{topic}/extra");
            prop_assert!(!topic_matches(&filter.join("/"), &longer));
        }

        #[test]
        fn plain_topics_pass_both_validators(topic in topic_strategy()) {
            prop_assert!(validate_topic_name(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
        }
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/b/c"));
        assert!(topic_matches("sensor/+/temp", "sensor/1/temp"));
        assert!(!topic_matches("sensor/+/temp", "sensor/1/humidity"));
        assert!(topic_matches("+", "a"));
        assert!(!topic_matches("+", "a/b"));
        assert!(topic_matches("a/+", "a/"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("sensor/#", "sensor/1/temp"));
        assert!(topic_matches("sensor/#", "sensor/1/humidity"));
        assert!(topic_matches("sensor/#", "sensor"));
        assert!(!topic_matches("sensor/#", "sensors/1"));
        assert!(topic_matches("#", "/filter/Publisher0"));
        // '#' in a non-final level is not a wildcard
        assert!(!topic_matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/+/uptime", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_leading_slash_is_an_empty_level() {
        assert!(topic_matches("/filter/+", "/filter/Publisher0"));
        assert!(topic_matches("+/filter/Publisher0", "/filter/Publisher0"));
        assert!(!topic_matches("filter/Publisher0", "/filter/Publisher0"));
    }

    #[test]
    fn test_empty_inputs_never_match() {
        assert!(!topic_matches("", "a"));
        assert!(!topic_matches("#", ""));
    }

    #[test]
    fn test_topic_name_validation() {
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
        assert_eq!(
            validate_topic_name("a/+/b"),
            Err(TopicError::WildcardInName('+'))
        );
        assert_eq!(
            validate_topic_name("a/#"),
            Err(TopicError::WildcardInName('#'))
        );
        assert_eq!(validate_topic_name("a\0b"), Err(TopicError::NulCharacter));
        let long = "x".repeat(MAX_TOPIC_LENGTH + 1);
        assert_eq!(
            validate_topic_name(&long),
            Err(TopicError::TooLong(MAX_TOPIC_LENGTH + 1))
        );
        assert!(validate_topic_name("/filter/Publisher0").is_ok());
    }

    #[test]
    fn test_topic_filter_validation() {
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("sensor/+/temp").is_ok());
        assert!(validate_topic_filter("sensor/#").is_ok());
        assert!(validate_topic_filter("+/+").is_ok());
        assert_eq!(
            validate_topic_filter("sensor/#/temp"),
            Err(TopicError::MisplacedMultiLevelWildcard)
        );
        assert_eq!(
            validate_topic_filter("sensor#"),
            Err(TopicError::MisplacedMultiLevelWildcard)
        );
        assert_eq!(
            validate_topic_filter("sensor/a+"),
            Err(TopicError::MisplacedSingleLevelWildcard)
        );
    }
}
