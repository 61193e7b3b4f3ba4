use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// Produces `<prefix>-<yyyymmdd-hhmmss>` space names, unique per instance:
/// a name already handed out gets a `-2`, `-3`, ... suffix.
#[derive(Debug, Clone)]
pub struct SpaceNameGenerator {
    prefix: String,
    used: HashSet<String>,
}

impl SpaceNameGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            used: HashSet::new(),
        }
    }

    pub fn next_name(&mut self) -> String {
        self.next_name_at(Utc::now())
    }

    pub fn next_name_at(&mut self, now: DateTime<Utc>) -> String {
        let base = format!("{}-{}", self.prefix, now.format("%Y%m%d-%H%M%S"));
        let mut name = base.clone();
        let mut n = 2u32;
        while self.used.contains(&name) {
            name = format!("{base}-{n}");
            n += 1;
        }
        self.used.insert(name.clone());
        name
    }
}
