use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use std::sync::Arc;

/// What a single request ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The server answered with this status code
    Status(u16),
    /// Timeout, connection failure or any other transport error
    Failed,
}

/// One bucket of the outcome taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Tracked(u16),
    Other,
    Error,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Tracked(code) => write!(f, "{code}"),
            Category::Other => f.write_str("other"),
            Category::Error => f.write_str("error"),
        }
    }
}

/// Maps outcomes onto the fixed category set decided at startup.
///
/// Every category owns a stable slot: tracked codes in configured order,
/// then `other`, then `error`. Counter arrays are sized with [`slot_count`](Self::slot_count)
/// once and never grow.
#[derive(Debug, Clone)]
pub struct Categorizer {
    tracked: Vec<u16>,
    labels: Arc<[String]>,
}

impl Categorizer {
    pub fn new(tracked: Vec<u16>) -> Self {
        let mut categorizer = Self {
            tracked,
            labels: Arc::from([]),
        };
        categorizer.labels = categorizer.categories().map(|c| c.to_string()).collect();
        categorizer
    }

    pub fn categorize(&self, outcome: Outcome) -> Category {
        match outcome {
            Outcome::Status(code) if self.tracked.contains(&code) => Category::Tracked(code),
            Outcome::Status(_) => Category::Other,
            Outcome::Failed => Category::Error,
        }
    }

    /// Slot index of `category`. An untracked code maps to the `other` slot.
    pub fn slot(&self, category: Category) -> usize {
        match category {
            Category::Tracked(code) => self
                .tracked
                .iter()
                .position(|&c| c == code)
                .unwrap_or(self.tracked.len()),
            Category::Other => self.tracked.len(),
            Category::Error => self.tracked.len() + 1,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.tracked.len() + 2
    }

    /// All categories in slot order.
    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.tracked
            .iter()
            .map(|&code| Category::Tracked(code))
            .chain([Category::Other, Category::Error])
    }

    pub fn zeroed(&self) -> CategoryCounts {
        CategoryCounts {
            labels: Arc::clone(&self.labels),
            values: vec![0; self.slot_count()],
        }
    }
}

/// Fixed-size counters, one per category, serialized as a `{label: count}` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCounts {
    labels: Arc<[String]>,
    values: Vec<u64>,
}

impl CategoryCounts {
    pub fn bump(&mut self, slot: usize) {
        self.values[slot] += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|idx| self.values[idx])
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.values.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.labels
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

impl Serialize for CategoryCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (label, count) in self.iter() {
            map.serialize_entry(label, &count)?;
        }
        map.end()
    }
}
