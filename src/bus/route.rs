//! Route management
//!
//! A `Route` holds the receivers entitled to one publisher's messages.
//! Receivers are kept ordered and deduplicated so fan-out happens in a
//! stable order.

use std::collections::{BTreeSet, HashMap};

/// Route table as supplied by configuration or the controller:
/// publisher id to receiver ids.
pub type RouteTable = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub publisher: String,
    pub receivers: BTreeSet<String>,
}

impl Route {
    pub fn new<I, S>(publisher: &str, receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            publisher: publisher.to_string(),
            receivers: receivers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.receivers.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

/// What changed in an `update`, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDiff {
    pub added_publishers: Vec<String>,
    pub removed_publishers: Vec<String>,
    pub added_receivers: Vec<String>,
    pub removed_receivers: Vec<String>,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.added_publishers.is_empty()
            && self.removed_publishers.is_empty()
            && self.added_receivers.is_empty()
            && self.removed_receivers.is_empty()
    }
}
