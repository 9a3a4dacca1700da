/// Scheduling priority of a load request.
///
/// Ordering follows urgency: `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Priority {
    /// Deep preload, first to be shed under pressure.
    Low,
    /// Near preload.
    #[default]
    Normal,
    /// On screen.
    High,
    /// Explicit user action; never shed by the pressure governor.
    Critical,
}

impl Priority {
    /// Convert the priority to a queue weight (higher is more urgent).
    pub fn weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// The more urgent of two priorities.
    pub fn elevate(self, other: Priority) -> Priority {
        self.max(other)
    }
}

/// Lifecycle of a request key inside the engine.
///
/// `Pending -> Active -> {Completed, Failed, Cancelled}`; a failure either
/// schedules a retry (back to `Pending`) or ends in `PermanentlyRejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
    PermanentlyRejected,
}

/// Byte-level progress of an active transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadProgress {
    pub received: u64,
    pub expected: Option<u64>,
}

impl LoadProgress {
    /// Fraction complete in `[0, 1]`, when the total is known.
    pub fn fraction(&self) -> Option<f32> {
        self.expected.filter(|total| *total > 0).map(|total| {
            (self.received as f64 / total as f64).clamp(0.0, 1.0) as f32
        })
    }
}
