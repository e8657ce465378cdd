//! Target drift detection.
//!
//! A target record is Conflicted when it has a baseline (`source_fingerprint`)
//! and its current fingerprint differs from it. Only an out-of-band edit can
//! produce that state; the engine always writes baseline and content together.

use psm_schemas::{Fingerprint, PropertyRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictState {
    Clean,
    Conflicted {
        /// Fingerprint of the source payload last written by a sync.
        baseline: Fingerprint,
        /// Fingerprint of the edited target payload.
        current: Fingerprint,
        /// Whether the incoming source payload differs from the baseline.
        source_changed: bool,
    },
}

impl ConflictState {
    pub fn is_conflicted(&self) -> bool {
        matches!(self, ConflictState::Conflicted { .. })
    }
}

/// Classify `target`. `incoming` only shapes the warning text; the decision
/// itself ignores it.
pub fn detect(target: &PropertyRecord, incoming: &Fingerprint) -> ConflictState {
    match &target.source_fingerprint {
        Some(baseline) if *baseline != target.fingerprint => ConflictState::Conflicted {
            baseline: baseline.clone(),
            current: target.fingerprint.clone(),
            source_changed: incoming != baseline,
        },
        _ => ConflictState::Clean,
    }
}

/// Warning stored on a Conflicted target during a run.
pub fn drift_warning(state: &ConflictState) -> Option<String> {
    match state {
        ConflictState::Clean => None,
        ConflictState::Conflicted {
            baseline,
            current,
            source_changed: true,
        } => Some(format!(
            "Source has changes but target has manual modifications. \
             Last synced {}, target now {}.",
            baseline.short(),
            current.short()
        )),
        ConflictState::Conflicted {
            baseline,
            current,
            source_changed: false,
        } => Some(manual_edit_warning(baseline, current)),
    }
}

/// Warning stored by the out-of-band edit path.
pub fn manual_edit_warning(baseline: &Fingerprint, current: &Fingerprint) -> String {
    format!(
        "Manual changes detected. Automatic sync disabled. Last synced {}, target now {}.",
        baseline.short(),
        current.short()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use psm_schemas::{Identity, Payload};

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_hex(c.to_string().repeat(64))
    }

    fn target(current: Fingerprint, baseline: Option<Fingerprint>) -> PropertyRecord {
        PropertyRecord {
            identity: Identity::from("P1"),
            payload: Payload::empty_map(),
            fingerprint: current,
            source_fingerprint: baseline,
            manual_change_flag: false,
            warning_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn never_synced_is_clean() {
        assert_eq!(detect(&target(fp('a'), None), &fp('b')), ConflictState::Clean);
    }

    #[test]
    fn matching_baseline_is_clean_even_if_source_changed() {
        assert_eq!(
            detect(&target(fp('a'), Some(fp('a'))), &fp('b')),
            ConflictState::Clean
        );
    }

    #[test]
    fn drift_is_conflicted_regardless_of_source() {
        let t = target(fp('c'), Some(fp('a')));
        assert!(detect(&t, &fp('a')).is_conflicted());
        assert!(detect(&t, &fp('b')).is_conflicted());
    }

    #[test]
    fn warning_mentions_source_change_only_when_it_happened() {
        let t = target(fp('c'), Some(fp('a')));

        let changed = drift_warning(&detect(&t, &fp('b'))).unwrap();
        assert!(changed.starts_with("Source has changes but target has manual modifications."));
        assert!(changed.contains("aaaaaaaaaaaa"));

        let unchanged = drift_warning(&detect(&t, &fp('a'))).unwrap();
        assert!(unchanged.starts_with("Manual changes detected. Automatic sync disabled."));
        assert!(unchanged.contains("cccccccccccc"));

        assert_eq!(drift_warning(&ConflictState::Clean), None);
    }
}
