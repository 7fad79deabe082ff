//! External inputs bound at evaluation time
//!
//! A [`Placeholder`] names a value a task needs but does not own, such as the
//! ids of the labeled support examples. Callers bind concrete values through a
//! [`FeedList`] and pass it to the accessors that depend on the placeholder.
//! Rebinding a placeholder never rebuilds the task.

use candle_core::Tensor;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PLACEHOLDER_ID: AtomicU64 = AtomicU64::new(0);

/// Handle of an external input, unique within the process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    id: u64,
    name: String,
}

impl Placeholder {
    /// Allocate a new placeholder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_PLACEHOLDER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    /// Placeholder name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process-unique id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// A placeholder bound to a concrete value
#[derive(Debug, Clone)]
pub struct Feed {
    /// Bound input
    pub placeholder: Placeholder,
    /// Concrete value
    pub value: Tensor,
}

/// Ordered list of bindings supplied with one evaluation
#[derive(Debug, Clone, Default)]
pub struct FeedList {
    feeds: Vec<Feed>,
}

impl FeedList {
    /// Create an empty feed list
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `placeholder` to `value`; a later binding replaces an earlier one
    pub fn push(&mut self, placeholder: Placeholder, value: Tensor) {
        self.feeds.retain(|feed| feed.placeholder != placeholder);
        self.feeds.push(Feed { placeholder, value });
    }

    /// Append all bindings of another list
    pub fn extend(&mut self, other: FeedList) {
        for feed in other.feeds {
            self.push(feed.placeholder, feed.value);
        }
    }

    /// Value bound to a placeholder
    pub fn get(&self, placeholder: &Placeholder) -> Option<&Tensor> {
        self.feeds
            .iter()
            .find(|feed| &feed.placeholder == placeholder)
            .map(|feed| &feed.value)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    /// Whether the list has no bindings
    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Iterate over bindings in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.iter()
    }
}

impl IntoIterator for FeedList {
    type Item = Feed;
    type IntoIter = std::vec::IntoIter<Feed>;

    fn into_iter(self) -> Self::IntoIter {
        self.feeds.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_placeholders_are_unique() {
        let a = Placeholder::new("support_labeled_ids");
        let b = Placeholder::new("support_labeled_ids");
        assert_eq!(a.name(), b.name());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_rebinding_replaces_value() {
        let placeholder = Placeholder::new("ids");
        let mut feeds = FeedList::new();
        feeds.push(
            placeholder.clone(),
            Tensor::new(&[0u32, 1], &Device::Cpu).unwrap(),
        );
        feeds.push(
            placeholder.clone(),
            Tensor::new(&[2u32], &Device::Cpu).unwrap(),
        );

        assert_eq!(feeds.len(), 1);
        let bound = feeds.get(&placeholder).unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(bound, vec![2]);
        assert!(feeds.get(&Placeholder::new("ids")).is_none());
    }
}
