//! File and scheduling priorities
//!
//! Priorities are a weighted sum of file and request properties, clamped
//! to [`PR_MIN`, `PR_MAX`].

use crate::config::PriorityWeights;

pub const PR_MIN: f64 = -1.0e10;
pub const PR_MAX: f64 = 1.0e10;

/// Properties of one file copy that feed its archive priority.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriorityInputs {
    /// Copy number 1..=4.
    pub copy: u8,
    /// Other copies of the file already archived.
    pub other_copies: u32,
    pub rearchive: bool,
    pub immediate: bool,
    /// The copy must exist before the file may be released.
    pub release_required: bool,
    pub age_secs: f64,
    pub size: u64,
}

pub fn clamp(priority: f64) -> f64 {
    if priority.is_nan() {
        return PR_MIN;
    }
    priority.clamp(PR_MIN, PR_MAX)
}

pub fn file_priority(w: &PriorityWeights, inputs: &PriorityInputs) -> f64 {
    let mut p = match inputs.copy {
        1..=4 => w.copy[inputs.copy as usize - 1],
        _ => 0.0,
    };
    p += w.copies * inputs.other_copies as f64;
    if inputs.rearchive {
        p += w.rearchive;
    }
    if inputs.immediate {
        p += w.immediate;
    }
    if inputs.release_required {
        p += w.release;
    }
    p += w.age * inputs.age_secs.max(0.0);
    p += w.size * inputs.size as f64;
    clamp(p)
}

/// Request facts known once resources have been found.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScheduleFactors {
    pub volume_loaded: bool,
    pub offline_files: bool,
    pub overflow: bool,
    pub waited_secs: f64,
}

pub fn schedule_priority(w: &PriorityWeights, base: f64, f: &ScheduleFactors) -> f64 {
    let mut p = base;
    if f.volume_loaded {
        p += w.loaded;
    }
    if f.offline_files {
        p += w.offline;
    }
    if f.overflow {
        p += w.overflow;
    }
    p += w.queue_wait * f.waited_secs.max(0.0);
    clamp(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> PriorityWeights {
        PriorityWeights {
            age: 0.5,
            size: 0.001,
            copy: [100.0, 50.0, 0.0, 0.0],
            copies: 10.0,
            rearchive: 7.0,
            immediate: 1000.0,
            release: 3.0,
            loaded: 20.0,
            offline: -5.0,
            overflow: 2.0,
            queue_wait: 1.0,
        }
    }

    #[test]
    fn test_file_priority_sum() {
        let inputs = PriorityInputs {
            copy: 2,
            other_copies: 1,
            rearchive: true,
            immediate: false,
            release_required: true,
            age_secs: 10.0,
            size: 1000,
        };
        let p = file_priority(&weights(), &inputs);
        assert!((p - (50.0 + 10.0 + 7.0 + 3.0 + 5.0 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_priority_is_clamped() {
        let mut w = weights();
        w.size = 1.0e6;
        let inputs = PriorityInputs {
            copy: 1,
            size: u64::MAX,
            ..Default::default()
        };
        assert_eq!(file_priority(&w, &inputs), PR_MAX);
        assert_eq!(clamp(f64::NAN), PR_MIN);
        assert_eq!(clamp(-1.0e20), PR_MIN);
    }

    #[test]
    fn test_schedule_priority_bonuses() {
        let f = ScheduleFactors {
            volume_loaded: true,
            offline_files: true,
            overflow: false,
            waited_secs: 4.0,
        };
        assert_eq!(schedule_priority(&weights(), 1.0, &f), 1.0 + 20.0 - 5.0 + 4.0);
    }
}
