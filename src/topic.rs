// src/topic.rs
use crate::errors::{RabRpcError, Result};
use crate::transform::PatternKind;

/// A parsed `<version>.<service>.<action>` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topic<'a> {
    raw: &'a str,
    version: &'a str,
    service: &'a str,
    action: &'a str,
}

impl<'a> Topic<'a> {
    pub fn parse(raw: &'a str) -> Result<Self> {
        let mut segments = raw.splitn(3, '.');
        let version = segments.next().unwrap_or_default();
        let service = segments.next().unwrap_or_default();
        let action = segments.next().unwrap_or_default();

        let well_formed = [version, service, action]
            .iter()
            .all(|segment| !segment.is_empty())
            && action.split('.').all(|segment| !segment.is_empty());
        if !well_formed {
            return Err(RabRpcError::InvalidTopic(raw.to_string()));
        }

        Ok(Self {
            raw,
            version,
            service,
            action,
        })
    }

    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    pub fn version(&self) -> &'a str {
        self.version
    }

    /// Service segment; doubles as the routing key.
    pub fn service(&self) -> &'a str {
        self.service
    }

    /// Everything after the service segment.
    pub fn action(&self) -> &'a str {
        self.action
    }

    pub fn exchange(&self, kind: PatternKind) -> String {
        kind.exchange_name(self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_version_service_and_action() {
        let topic = Topic::parse("v1.billing.charge").unwrap();
        assert_eq!(topic.version(), "v1");
        assert_eq!(topic.service(), "billing");
        assert_eq!(topic.action(), "charge");
        assert_eq!(topic.as_str(), "v1.billing.charge");
    }

    #[test]
    fn action_may_contain_dots() {
        let topic = Topic::parse("v2.users.profile.update").unwrap();
        assert_eq!(topic.service(), "users");
        assert_eq!(topic.action(), "profile.update");
    }

    #[test]
    fn derives_exchange_per_pattern() {
        let topic = Topic::parse("v1.test.action").unwrap();
        assert_eq!(topic.exchange(PatternKind::Request), "req-res.test");
        assert_eq!(topic.exchange(PatternKind::Receive), "send-recv.test");
        assert_eq!(topic.exchange(PatternKind::Publish), "pub-sub.test");
    }

    #[test]
    fn rejects_malformed_topics() {
        for raw in ["", "v1", "v1.test", "v1..action", ".test.action", "v1.test.", "v1.test.a..b"] {
            let err = Topic::parse(raw).unwrap_err();
            assert!(matches!(err, RabRpcError::InvalidTopic(_)), "{raw:?}");
        }
    }
}
