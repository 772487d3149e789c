//! Neighbor and reference frame selection.
//!
//! Neighbors are the contiguous frames around a window's target index. References are
//! temporally distant frames sampled at a fixed step that only give the model long-range
//! context; their predictions are thrown away.

use crate::error::InpaintError;

/// How many reference frames a window may collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceLimit {
    /// Sample the whole video at the reference step.
    #[default]
    Unbounded,
    /// Sample only around the target. Soft cap: up to `n + 1` references come back.
    AtMost(usize),
}

impl ReferenceLimit {
    /// Maps the conventional signed setting: `-1` is unbounded, `n >= 0` is a cap.
    pub fn from_signed(value: i64) -> Result<Self, InpaintError> {
        match value {
            -1 => Ok(Self::Unbounded),
            n if n >= 0 => Ok(Self::AtMost(n as usize)),
            n => Err(InpaintError::InvalidConfig(format!(
                "num_ref must be -1 (unbounded) or >= 0, got {n}"
            ))),
        }
    }

    pub fn as_signed(&self) -> i64 {
        match self {
            Self::Unbounded => -1,
            Self::AtMost(n) => *n as i64,
        }
    }
}

impl std::fmt::Display for ReferenceLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbounded => write!(f, "unbounded"),
            Self::AtMost(n) => write!(f, "{n}"),
        }
    }
}

/// Frames within `radius` of `target`, clamped to `[0, len)`. Always contains `target`
/// when `target < len`.
pub fn neighbor_ids(target: usize, radius: usize, len: usize) -> Vec<usize> {
    let start = target.saturating_sub(radius);
    let end = target.saturating_add(radius).saturating_add(1).min(len);
    (start..end).collect()
}

/// Reference frames for the window around `target`, in ascending order, never overlapping
/// `neighbor_ids`.
///
/// With [`ReferenceLimit::AtMost`] the scan covers
/// `[target - step * (n / 2), target + step * (n / 2))` and stops once *more* than `n`
/// frames were gathered, so `n + 1` references are possible. A `step` of zero yields no
/// references.
pub fn select_references(
    target: usize,
    neighbor_ids: &[usize],
    len: usize,
    step: usize,
    limit: ReferenceLimit,
) -> Vec<usize> {
    if step == 0 {
        return Vec::new();
    }

    match limit {
        ReferenceLimit::Unbounded => (0..len)
            .step_by(step)
            .filter(|i| !neighbor_ids.contains(i))
            .collect(),
        ReferenceLimit::AtMost(max_refs) => {
            let half_span = step.saturating_mul(max_refs / 2);
            let start = target.saturating_sub(half_span);
            let end = target.saturating_add(half_span).min(len);

            let mut refs = Vec::new();
            for i in (start..end).step_by(step) {
                if neighbor_ids.contains(&i) {
                    continue;
                }
                if refs.len() > max_refs {
                    break;
                }
                refs.push(i);
            }
            refs
        }
    }
}
