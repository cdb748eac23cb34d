//! MQTT topic filters.
//!
//! A filter is a `/`-separated list of levels where `+` matches exactly one
//! level and a trailing `#` matches any number of remaining levels
//! (including none).  Matching is case-sensitive.

use stepper_types::StepperError;

/// A validated topic filter such as `stepper/+/axis/+/home`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    levels: Vec<String>,
}

impl TopicFilter {
    /// Parse and validate `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`StepperError::PubSub`] when the filter is empty, when a
    /// wildcard shares a level with other characters, or when `#` is not the
    /// last level.
    pub fn new(filter: &str) -> Result<Self, StepperError> {
        if filter.is_empty() {
            return Err(StepperError::PubSub("empty topic filter".to_string()));
        }
        let levels: Vec<String> = filter.split('/').map(str::to_string).collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            let bad_multi = level.contains('#') && (level != "#" || i != last);
            let bad_single = level.contains('+') && level != "+";
            if bad_multi || bad_single {
                return Err(StepperError::PubSub(format!(
                    "invalid topic filter '{filter}': bad wildcard in level {i}"
                )));
            }
        }
        Ok(Self { levels })
    }

    /// `true` if `topic` is delivered to a subscriber of this filter.
    ///
    /// Topics starting with `$` are never matched by a leading wildcard.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && matches!(self.levels[0].as_str(), "+" | "#") {
            return false;
        }
        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level.as_str() {
                "#" => return true,
                "+" => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                literal => {
                    if topic_levels.next() != Some(literal) {
                        return false;
                    }
                }
            }
        }
        topic_levels.next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_filter_matches_only_itself() {
        let f = TopicFilter::new("stepper/1/enable").unwrap();
        assert!(f.matches("stepper/1/enable"));
        assert!(!f.matches("stepper/1/enable/extra"));
        assert!(!f.matches("stepper/1"));
        assert!(!f.matches("Stepper/1/enable"));
    }

    #[test]
    fn single_level_wildcard() {
        let f = TopicFilter::new("stepper/+/axis/+/move/absolute").unwrap();
        assert!(f.matches("stepper/1/axis/0/move/absolute"));
        assert!(f.matches("stepper/stepper1/axis/1/move/absolute"));
        assert!(!f.matches("stepper/1/axis/0/move/relative"));
        assert!(!f.matches("stepper/1/axis/move/absolute"));
    }

    #[test]
    fn multi_level_wildcard_matches_parent_and_children() {
        let f = TopicFilter::new("stepper/#").unwrap();
        assert!(f.matches("stepper"));
        assert!(f.matches("stepper/1/axis/0/ack"));
        assert!(!f.matches("other/1"));
    }

    #[test]
    fn leading_wildcard_skips_system_topics() {
        let f = TopicFilter::new("#").unwrap();
        assert!(f.matches("stepper/1"));
        assert!(!f.matches("$SYS/broker/uptime"));
    }

    #[test]
    fn invalid_filters_are_rejected() {
        for bad in ["", "stepper/#/axis", "stepper/a+", "stepper/ab#"] {
            assert!(TopicFilter::new(bad).is_err(), "filter {bad:?} must be rejected");
        }
    }
}
