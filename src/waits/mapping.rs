use std::collections::HashMap;

/// How a raw wait type is treated before it reaches the accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitRule {
    pub mapped_to: Option<String>,
    pub excluded: bool,
}

/// Read-only lookup from raw wait type to normalization/exclusion info.
///
/// Built once at startup and shared behind an `Arc`; lookups need no locking.
#[derive(Debug, Clone, Default)]
pub struct WaitMapping {
    rules: HashMap<String, WaitRule>,
}

impl WaitMapping {
    pub fn new<E, M>(excluded: E, mapped: M) -> Self
    where
        E: IntoIterator<Item = String>,
        M: IntoIterator<Item = (String, String)>,
    {
        let mut rules: HashMap<String, WaitRule> = HashMap::new();
        for (raw, label) in mapped {
            let label = label.trim().to_string();
            rules.entry(raw).or_default().mapped_to = (!label.is_empty()).then_some(label);
        }
        for raw in excluded {
            rules.entry(raw).or_default().excluded = true;
        }
        Self { rules }
    }

    pub fn lookup(&self, wait: &str) -> Option<&WaitRule> {
        self.rules.get(wait)
    }

    /// Returns the label a wait accumulates under, or `None` when the wait is
    /// empty or excluded. Unknown waits keep their raw name.
    pub fn normalize<'a>(&'a self, wait: &'a str) -> Option<&'a str> {
        if wait.is_empty() {
            return None;
        }
        match self.rules.get(wait) {
            Some(rule) if rule.excluded => None,
            Some(WaitRule {
                mapped_to: Some(label),
                ..
            }) => Some(label.as_str()),
            _ => Some(wait),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
