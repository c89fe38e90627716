use relay_topology::NodeAddr;
use relay_transport::{Mutation, RecordChange, TopicRecord};

use crate::error::{BrokerError, BrokerResult};

/// Validates `mutation` against the current record of its topic and computes
/// the resulting change.
///
/// `local` is the address of the broker instance hosting the topic, used to
/// refuse links from a topic to itself. Returns `Ok(None)` when the mutation
/// succeeds without changing anything (unsubscribing an absent identity).
///
/// # Errors
///
/// Returns the user error describing why the mutation cannot be applied.
pub fn plan_change(
    local: &NodeAddr,
    current: Option<&TopicRecord>,
    mutation: &Mutation,
) -> BrokerResult<Option<RecordChange>> {
    let existing = |name: &str| {
        current
            .cloned()
            .ok_or_else(|| BrokerError::NoSuchTopic(name.to_string()))
    };

    match mutation {
        Mutation::CreateTopic { name } => {
            if current.is_some() {
                return Err(BrokerError::TopicExists(name.clone()));
            }
            Ok(Some(RecordChange::Put(TopicRecord::new(name.clone()))))
        }

        Mutation::DestroyTopic { name } => {
            existing(name)?;
            Ok(Some(RecordChange::Delete(name.clone())))
        }

        Mutation::Subscribe {
            topic,
            subscription,
        } => {
            let mut record = existing(topic)?;
            if record.subscribers.contains_key(&subscription.identity) {
                return Err(BrokerError::AlreadySubscribed {
                    topic: topic.clone(),
                    identity: subscription.identity.clone(),
                });
            }
            record
                .subscribers
                .insert(subscription.identity.clone(), subscription.clone());
            Ok(Some(RecordChange::Put(record)))
        }

        Mutation::Unsubscribe { topic, identity } => {
            let mut record = existing(topic)?;
            if record.subscribers.remove(identity).is_none() {
                return Ok(None);
            }
            Ok(Some(RecordChange::Put(record)))
        }

        Mutation::Link { topic, link } => {
            let mut record = existing(topic)?;
            if &link.remote.node == local && &link.remote.topic == topic {
                return Err(BrokerError::InvalidLink {
                    topic: topic.clone(),
                    reason: "a topic cannot be linked to itself".to_string(),
                });
            }
            if record.links.contains_key(&link.remote) {
                return Err(BrokerError::AlreadyLinked {
                    topic: topic.clone(),
                    remote: link.remote.clone(),
                });
            }
            record.links.insert(link.remote.clone(), link.clone());
            Ok(Some(RecordChange::Put(record)))
        }

        Mutation::Unlink { topic, remote } => {
            let mut record = existing(topic)?;
            if record.links.remove(remote).is_none() {
                return Err(BrokerError::NoSuchLink {
                    topic: topic.clone(),
                    remote: remote.clone(),
                });
            }
            Ok(Some(RecordChange::Put(record)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use relay_topology::{EndpointAddr, TopicRef};
    use relay_transport::{LinkRecord, Qos, SubscriptionRecord};

    fn local() -> NodeAddr {
        NodeAddr::from("broker-x")
    }

    fn subscription(identity: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            identity: identity.to_string(),
            endpoint: EndpointAddr::from(identity),
            qos: Qos::twoway(),
        }
    }

    fn subscribe(topic: &str, identity: &str) -> Mutation {
        Mutation::Subscribe {
            topic: topic.to_string(),
            subscription: subscription(identity),
        }
    }

    #[test]
    fn test_create_twice_fails() {
        let record = TopicRecord::new("t");
        let create = Mutation::CreateTopic {
            name: "t".to_string(),
        };

        assert_matches!(
            plan_change(&local(), None, &create),
            Ok(Some(RecordChange::Put(r))) if r == record
        );
        assert_matches!(
            plan_change(&local(), Some(&record), &create),
            Err(BrokerError::TopicExists(name)) if name == "t"
        );
    }

    #[test]
    fn test_missing_topic() {
        let destroy = Mutation::DestroyTopic {
            name: "t".to_string(),
        };
        assert_matches!(
            plan_change(&local(), None, &destroy),
            Err(BrokerError::NoSuchTopic(_))
        );
        assert_matches!(
            plan_change(&local(), None, &subscribe("t", "a")),
            Err(BrokerError::NoSuchTopic(_))
        );
    }

    #[test]
    fn test_duplicate_subscribe_rejected() {
        let Ok(Some(RecordChange::Put(record))) =
            plan_change(&local(), Some(&TopicRecord::new("t")), &subscribe("t", "a"))
        else {
            panic!("subscribe should produce a record");
        };
        assert!(record.subscribers.contains_key("a"));

        assert_matches!(
            plan_change(&local(), Some(&record), &subscribe("t", "a")),
            Err(BrokerError::AlreadySubscribed { identity, .. }) if identity == "a"
        );
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let unsubscribe = Mutation::Unsubscribe {
            topic: "t".to_string(),
            identity: "nobody".to_string(),
        };
        assert_matches!(
            plan_change(&local(), Some(&TopicRecord::new("t")), &unsubscribe),
            Ok(None)
        );
    }

    #[test]
    fn test_link_rules() {
        let record = TopicRecord::new("t");
        let link = |remote: TopicRef| Mutation::Link {
            topic: "t".to_string(),
            link: LinkRecord { remote, cost: 0 },
        };

        assert_matches!(
            plan_change(&local(), Some(&record), &link(TopicRef::new("broker-x", "t"))),
            Err(BrokerError::InvalidLink { .. })
        );

        // Same name on another instance, or another topic here, is fine.
        assert_matches!(
            plan_change(&local(), Some(&record), &link(TopicRef::new("broker-x", "u"))),
            Ok(Some(_))
        );
        let Ok(Some(RecordChange::Put(linked))) =
            plan_change(&local(), Some(&record), &link(TopicRef::new("broker-y", "t")))
        else {
            panic!("link should produce a record");
        };

        assert_matches!(
            plan_change(&local(), Some(&linked), &link(TopicRef::new("broker-y", "t"))),
            Err(BrokerError::AlreadyLinked { .. })
        );

        let unlink = Mutation::Unlink {
            topic: "t".to_string(),
            remote: TopicRef::new("broker-y", "t"),
        };
        assert_matches!(
            plan_change(&local(), Some(&linked), &unlink),
            Ok(Some(RecordChange::Put(r))) if r.links.is_empty()
        );
        assert_matches!(
            plan_change(&local(), Some(&record), &unlink),
            Err(BrokerError::NoSuchLink { .. })
        );
    }
}
