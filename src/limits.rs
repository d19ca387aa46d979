/// Instance-wide resource policy, settable at any time on a [`crate::Handle`].
///
/// Lowering `max_value_length_sum` triggers eviction on the next mutating
/// commit (see the eviction module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Upper bound on the sum of lengths of all live manifest entries.
    pub max_value_length_sum: u64,
    /// Skip hole punching entirely on eviction; only manifest rows are
    /// forgotten. Also bypasses the hole-punch capability probe at open.
    pub disable_hole_punching: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_value_length_sum: u64::MAX,
            disable_hole_punching: false,
        }
    }
}
