//! Channel and stream key naming.
//!
//! - `<ns>.events.all` carries every event
//! - `<ns>.events.<type>` carries one event type
//! - `<ns>.matches.all` carries every `matches.*` event
//! - `<ns>:events:<prefix>` is the capped stream for a category

use crate::objects::EventType;

pub const DEFAULT_NAMESPACE: &str = "refsync";

/// Derives every channel and stream name from a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    namespace: String,
}

impl ChannelNames {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn all_events(&self) -> String {
        format!("{}.events.all", self.namespace)
    }

    pub fn for_type(&self, event_type: EventType) -> String {
        format!("{}.events.{}", self.namespace, event_type.as_str())
    }

    /// Domain shortcut channel for match events.
    pub fn matches(&self) -> String {
        format!("{}.matches.all", self.namespace)
    }

    /// Every channel an event of this type is published to.
    pub fn targets(&self, event_type: EventType) -> Vec<String> {
        let mut channels = vec![self.all_events(), self.for_type(event_type)];
        if event_type.is_match_event() {
            channels.push(self.matches());
        }
        channels
    }

    /// Channels a consumer listens on when none are given.
    pub fn default_subscription(&self) -> Vec<String> {
        vec![self.matches(), self.all_events()]
    }

    pub fn stream_key(&self, event_type: EventType) -> String {
        format!("{}:events:{}", self.namespace, event_type.prefix())
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_events_reach_the_shortcut_channel() {
        let names = ChannelNames::new("fogis");
        assert_eq!(
            names.targets(EventType::MatchesUpdated),
            vec![
                "fogis.events.all".to_string(),
                "fogis.events.matches.updated".to_string(),
                "fogis.matches.all".to_string(),
            ]
        );
    }

    #[test]
    fn test_system_events_skip_the_shortcut_channel() {
        let names = ChannelNames::new("fogis");
        assert_eq!(
            names.targets(EventType::SystemAlert),
            vec![
                "fogis.events.all".to_string(),
                "fogis.events.system.alert".to_string(),
            ]
        );
    }

    #[test]
    fn test_stream_keys_group_by_prefix() {
        let names = ChannelNames::default();
        assert_eq!(names.stream_key(EventType::MatchesAdded), "refsync:events:matches");
        assert_eq!(names.stream_key(EventType::MatchesSnapshot), "refsync:events:matches");
        assert_eq!(names.stream_key(EventType::ServiceStopped), "refsync:events:service");
    }

    #[test]
    fn test_default_subscription() {
        let names = ChannelNames::new("ns");
        assert_eq!(
            names.default_subscription(),
            vec!["ns.matches.all".to_string(), "ns.events.all".to_string()]
        );
    }
}
