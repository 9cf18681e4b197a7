//! Flaky-failure detection.

use testpulse_state::{DefectType, TestRunResult, TestRunStore, TestStatus};

use crate::obs;

/// A history that both passed and failed is flaky.
pub fn mixes_pass_and_failure(history: &[TestStatus]) -> bool {
    history.iter().any(|s| s.is_pass()) && history.iter().any(|s| s.is_failure())
}

/// Check the last `limit` statuses of the result's (test, suite, commit).
///
/// A failed history lookup counts as "not flaky".
pub(crate) async fn looks_flaky(
    runs: &dyn TestRunStore,
    result: &TestRunResult,
    limit: usize,
) -> bool {
    match runs
        .history_for(
            &result.test_id,
            &result.suite_id,
            result.commit_id.as_ref(),
            limit,
        )
        .await
    {
        Ok(history) => mixes_pass_and_failure(&history),
        Err(e) => {
            obs::emit_lookup_degraded("flaky_history", &e);
            false
        }
    }
}

/// Only the Project/Flaky pair is ever swapped; every other type is sticky.
pub(crate) fn reclassify(current: DefectType, flaky: bool) -> DefectType {
    match (current, flaky) {
        (DefectType::Project, true) => DefectType::Flaky,
        (DefectType::Flaky, false) => DefectType::Project,
        (other, _) => other,
    }
}

/// Type of a row reopened by a new failure. Local runs always give `Local`.
/// Triage verdicts (Environmental, InvalidTest, Outside, NewTest) carry over;
/// anything else is typed afresh like a new defect.
pub(crate) fn reopen_type(previous: DefectType, local: bool, flaky: bool) -> DefectType {
    match previous {
        _ if local => DefectType::Local,
        DefectType::Local | DefectType::Project | DefectType::Flaky => {
            if flaky {
                DefectType::Flaky
            } else {
                DefectType::Project
            }
        }
        sticky => sticky,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_history_is_flaky() {
        use TestStatus::*;
        assert!(mixes_pass_and_failure(&[Fail, Pass, Fail]));
        assert!(mixes_pass_and_failure(&[Broken, Pass]));
        assert!(!mixes_pass_and_failure(&[Fail, Error, Broken]));
        assert!(!mixes_pass_and_failure(&[Pass, Skipped]));
        assert!(!mixes_pass_and_failure(&[]));
    }

    #[test]
    fn only_project_and_flaky_swap() {
        assert_eq!(reclassify(DefectType::Project, true), DefectType::Flaky);
        assert_eq!(reclassify(DefectType::Flaky, false), DefectType::Project);
        assert_eq!(reclassify(DefectType::Local, true), DefectType::Local);
        assert_eq!(
            reclassify(DefectType::Environmental, false),
            DefectType::Environmental
        );
    }

    #[test]
    fn reopen_retypes_all_but_triage_verdicts() {
        assert_eq!(reopen_type(DefectType::Local, false, false), DefectType::Project);
        assert_eq!(reopen_type(DefectType::Local, false, true), DefectType::Flaky);
        assert_eq!(reopen_type(DefectType::Flaky, false, false), DefectType::Project);
        assert_eq!(reopen_type(DefectType::Project, true, false), DefectType::Local);
        assert_eq!(
            reopen_type(DefectType::Environmental, false, true),
            DefectType::Environmental
        );
        assert_eq!(
            reopen_type(DefectType::InvalidTest, false, false),
            DefectType::InvalidTest
        );
    }
}
