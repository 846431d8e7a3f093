//! NIP-01 subscription filters.
//!
//! Predicates inside one filter are AND'd; a list of filters matches an
//! event when any of them does. `limit` is not a per-event predicate, it
//! caps how many stored events a relay (or local store) returns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::SignedEvent;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Tag queries keyed with the `#` prefix (`#e`, `#p`, ...).
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn kind(self, kind: u16) -> Self {
        self.kinds([kind])
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Add a tag query. `name` may be given with or without the `#`.
    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if name.starts_with('#') {
            name.to_string()
        } else {
            format!("#{}", name)
        };
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Events referencing any of the given event ids (`#e`).
    pub fn references_events(self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", ids)
    }

    /// Events referencing any of the given pubkeys (`#p`).
    pub fn references_pubkeys(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    pub fn matches(&self, event: &SignedEvent) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| event.id.starts_with(id.as_str())) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors
                .iter()
                .any(|author| event.pubkey.starts_with(author.as_str()))
            {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            event
                .tag_values(name)
                .any(|value| values.iter().any(|wanted| wanted == value))
        })
    }
}

/// True when any filter in the list matches.
pub fn matches_any(filters: &[Filter], event: &SignedEvent) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}
