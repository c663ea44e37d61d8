//! Newtype wrappers and type aliases for domain concepts.
//!
//! Newtypes for identifiers (thread IDs, thread-group IDs, CPU IDs) prevent
//! silent type confusion. Type aliases for quantities (timestamps,
//! priorities) provide self-documenting code without the boilerplate of
//! implementing arithmetic traits.

use serde::Serialize;

/// Thread identifier. Doubles as the index into the scheduler's thread arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Tid(pub u32);

/// Thread-group identifier. Index into the scheduler's group arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupId(pub u32);

/// Processor (CPU) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CpuId(pub u32);

/// Simulated time in microseconds.
pub type TimeUs = u64;

/// Scheduling priority. `NOPRI` (-1) marks "no candidate".
pub type Pri = i32;

/// The six QoS bands of the Clutch hierarchy, highest first.
///
/// `Fixpri` (Above UI) is the strict fixed-priority lane; the remaining five
/// are timeshare lanes that compete via EDF on root-bucket deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Bucket {
    Fixpri = 0,
    Fg = 1,
    In = 2,
    Df = 3,
    Ut = 4,
    Bg = 5,
}

/// Number of schedulable QoS buckets.
pub const NUM_BUCKETS: usize = 6;

impl Bucket {
    pub const ALL: [Bucket; NUM_BUCKETS] = [
        Bucket::Fixpri,
        Bucket::Fg,
        Bucket::In,
        Bucket::Df,
        Bucket::Ut,
        Bucket::Bg,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Bucket {
        Self::ALL[idx]
    }

    pub fn name(self) -> &'static str {
        match self {
            Bucket::Fixpri => "FIXPRI",
            Bucket::Fg => "FG",
            Bucket::In => "IN",
            Bucket::Df => "DF",
            Bucket::Ut => "UT",
            Bucket::Bg => "BG",
        }
    }

    /// Whether this is the fixed-priority Above UI bucket (exempt from EDF).
    pub fn is_above_timeshare(self) -> bool {
        self == Bucket::Fixpri
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_roundtrip() {
        for b in Bucket::ALL {
            assert_eq!(Bucket::from_index(b.index()), b);
        }
        assert!(Bucket::Fixpri.is_above_timeshare());
        assert!(!Bucket::Bg.is_above_timeshare());
    }
}
