use std::fmt;

/// Urgency of a queued command
///
/// Variants are ordered from most to least urgent, so `Priority::High < Priority::Low`.
/// The ordinal of a variant is the index of its bucket in the
/// [`PriorityQueue`](crate::PriorityQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Stepping, resuming and suspend-context notifications
    High,
    /// Ordinary work
    #[default]
    Normal,
    /// Housekeeping such as breakpoint updates
    Low,
    /// Work that should only run when nothing else is waiting
    Lowest,
}

impl Priority {
    /// Number of distinct priorities, and so the number of queue buckets
    pub const COUNT: usize = 4;

    /// Every priority, most urgent first
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Lowest,
    ];

    pub const fn ordinal(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
            Priority::Lowest => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Lowest => "lowest",
        };
        f.write_str(name)
    }
}
