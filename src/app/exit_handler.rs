//! Exit code logic for the mangabook process.
//!
//! Single responsibility: map a run summary to the process exit outcome.

use mangabook_core::RunSummary;

use crate::ProcessExit;

/// Determines the process exit outcome from a finished run.
///
/// Interrupted runs and runs where some units or groups failed are partial
/// as long as anything is on disk; runs where nothing succeeded are failures.
pub(crate) fn determine_exit_outcome(summary: &RunSummary) -> ProcessExit {
    if summary.is_success() {
        return ProcessExit::Success;
    }
    let succeeded = summary.downloaded() + summary.skipped_valid();
    if summary.interrupted || succeeded > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[cfg(test)]
mod tests {
    use mangabook_core::{GroupReport, GroupState};

    use super::determine_exit_outcome;
    use crate::ProcessExit;

    fn group(state: GroupState, downloaded: usize, failed: usize) -> GroupReport {
        let mut report = GroupReport::new("1", "Volume 1");
        report.state = state;
        report.downloaded = downloaded;
        report.failed_retryable = failed;
        report
    }

    fn summary(groups: Vec<GroupReport>, interrupted: bool) -> mangabook_core::RunSummary {
        let mut summary = mangabook_core::RunSummary::new("root");
        summary.groups = groups;
        summary.interrupted = interrupted;
        summary
    }

    #[test]
    fn test_exit_outcome_success_when_all_groups_complete() {
        let run = summary(vec![group(GroupState::Complete, 3, 0)], false);
        assert_eq!(determine_exit_outcome(&run), ProcessExit::Success);
    }

    #[test]
    fn test_exit_outcome_success_when_nothing_to_do() {
        assert_eq!(determine_exit_outcome(&summary(Vec::new(), false)), ProcessExit::Success);
    }

    #[test]
    fn test_exit_outcome_partial_when_mixed() {
        let run = summary(vec![group(GroupState::PartiallyFailed, 2, 1)], false);
        assert_eq!(determine_exit_outcome(&run), ProcessExit::Partial);
    }

    #[test]
    fn test_exit_outcome_partial_when_interrupted() {
        let run = summary(vec![group(GroupState::Planning, 0, 0)], true);
        assert_eq!(determine_exit_outcome(&run), ProcessExit::Partial);
    }

    #[test]
    fn test_exit_outcome_failure_when_all_failed() {
        let run = summary(
            vec![
                group(GroupState::PartiallyFailed, 0, 2),
                group(GroupState::Unavailable, 0, 0),
            ],
            false,
        );
        assert_eq!(determine_exit_outcome(&run), ProcessExit::Failure);
    }
}
