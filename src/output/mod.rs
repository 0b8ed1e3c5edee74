//! CLI output formatting and display helpers.
//!
//! Builders return lines so tests can check the text; `print_*` wrappers
//! write them to stdout.

use std::path::Path;

use mangabook_core::{EntryStatus, GroupPlan, GroupState, Manifest, RunSummary, WorkReason};

/// Returns terminal width from COLUMNS, or 80 if unset/invalid.
pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|width| *width >= 20)
        .unwrap_or(80)
}

/// Truncates text to at most `width` chars, appending ellipsis if truncated.
pub fn truncate_to_width(text: &str, width: usize) -> String {
    let text_len = text.chars().count();
    if text_len <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    if width == 1 {
        return "…".to_string();
    }

    let mut output: String = text.chars().take(width - 1).collect();
    output.push('…');
    output
}

fn print_lines(lines: &[String]) {
    let width = terminal_width();
    for line in lines {
        println!("{}", truncate_to_width(line, width));
    }
}

fn group_marker(state: GroupState) -> &'static str {
    match state {
        GroupState::Complete => "✓",
        GroupState::PartiallyFailed => "!",
        GroupState::Unavailable => "✗",
        _ => "-",
    }
}

pub(crate) fn completion_summary_lines(
    title: &str,
    series_dir: &Path,
    summary: &RunSummary,
) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("{title}: {}", series_dir.display()));

    for group in &summary.groups {
        let mut line = format!(
            "  {} {:<12} {}: {} downloaded, {} up to date",
            group_marker(group.state),
            group.label,
            group.state,
            group.downloaded,
            group.skipped_valid
        );
        if group.failed() > 0 {
            line.push_str(&format!(", {} failed", group.failed()));
        }
        if group.cancelled > 0 {
            line.push_str(&format!(", {} cancelled", group.cancelled));
        }
        if let Some(error) = &group.error {
            line.push_str(&format!(" ({error})"));
        }
        lines.push(line);
    }

    lines.push(format!(
        "{} pages downloaded, {} already up to date, {} failed ({} retries)",
        summary.downloaded(),
        summary.skipped_valid(),
        summary.failed(),
        summary.retried()
    ));

    if summary.failed_retryable() > 0 {
        lines.push(format!(
            "  {} page(s) failed after retries; re-running may help.",
            summary.failed_retryable()
        ));
    }
    if summary.failed_fatal() > 0 {
        lines.push(format!(
            "  {} page(s) failed permanently and need intervention.",
            summary.failed_fatal()
        ));
    }
    if summary.needs_reauth() {
        lines.push(
            "  The server rejected the session; refresh MANGABOOK_API_TOKEN and run again."
                .to_string(),
        );
    }
    if summary.unavailable() > 0 {
        lines.push(format!(
            "  {} volume(s) could not be listed.",
            summary.unavailable()
        ));
    }
    if summary.interrupted {
        lines.push("Interrupted. Run again to resume.".to_string());
    }
    lines
}

/// Prints the end-of-run summary.
pub(crate) fn print_completion_summary(title: &str, series_dir: &Path, summary: &RunSummary) {
    print_lines(&completion_summary_lines(title, series_dir, summary));
}

pub(crate) fn plan_lines(title: &str, plans: &[GroupPlan]) -> Vec<String> {
    let mut lines = vec![format!("Dry run for {title}:")];
    let mut total = 0;
    for group_plan in plans {
        let plan = &group_plan.plan;
        total += plan.refetch.len();
        let mut line = format!(
            "  {:<12} {} to fetch, {} up to date",
            group_plan.group.label,
            plan.refetch.len(),
            plan.keep.len()
        );
        let reasons: Vec<String> = [
            WorkReason::Missing,
            WorkReason::Invalid,
            WorkReason::Outdated,
            WorkReason::Forced,
        ]
        .into_iter()
        .filter_map(|reason| {
            let count = plan.count(reason);
            (count > 0).then(|| format!("{count} {reason}"))
        })
        .collect();
        if !reasons.is_empty() {
            line.push_str(&format!(" ({})", reasons.join(", ")));
        }
        lines.push(line);
    }
    lines.push(format!("{total} page(s) would be downloaded."));
    lines
}

/// Prints the reconcile plan for `--dry-run`.
pub(crate) fn print_plan(title: &str, plans: &[GroupPlan]) {
    print_lines(&plan_lines(title, plans));
}

pub(crate) fn status_lines(manifest: &Manifest, manifest_path: &Path) -> Vec<String> {
    if manifest.is_empty() {
        return vec![format!(
            "No downloads recorded for {} (looked in {}).",
            manifest.root_id(),
            manifest_path.display()
        )];
    }

    let mut lines = vec![format!(
        "{}: {} page(s) recorded",
        manifest.root_id(),
        manifest.len()
    )];
    for status in [
        EntryStatus::Downloaded,
        EntryStatus::Failed,
        EntryStatus::Invalid,
        EntryStatus::Pending,
    ] {
        let count = manifest.count_by_status(status);
        if count > 0 {
            lines.push(format!("  {:<11} {count}", status.as_str()));
        }
    }

    let mut groups: Vec<_> = manifest.groups().collect();
    groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    let complete: Vec<&str> = groups
        .iter()
        .filter(|group| group.complete)
        .map(|group| group.group_id.as_str())
        .collect();
    let incomplete: Vec<&str> = groups
        .iter()
        .filter(|group| !group.complete)
        .map(|group| group.group_id.as_str())
        .collect();
    lines.push(format!(
        "Volumes complete: {}",
        if complete.is_empty() { "none".to_string() } else { complete.join(", ") }
    ));
    if !incomplete.is_empty() {
        lines.push(format!("Volumes incomplete: {}", incomplete.join(", ")));
    }
    lines
}

/// Prints the manifest summary for `status`.
pub(crate) fn print_status(manifest: &Manifest, manifest_path: &Path) {
    print_lines(&status_lines(manifest, manifest_path));
}

/// One line per recorded manga, newest activity first.
pub(crate) fn library_lines(manifests: &[Manifest], output_dir: &Path) -> Vec<String> {
    if manifests.is_empty() {
        return vec![format!("No downloads recorded in {}.", output_dir.display())];
    }

    let mut ordered: Vec<&Manifest> = manifests.iter().collect();
    ordered.sort_by(|a, b| b.last_updated().cmp(&a.last_updated()));

    let mut lines = vec![format!(
        "{} manga recorded in {}",
        manifests.len(),
        output_dir.display()
    )];
    for manifest in ordered {
        let groups = manifest.groups().count();
        let complete = manifest.groups().filter(|group| group.complete).count();
        let updated = manifest.last_updated().map_or_else(
            || "never".to_string(),
            |at| at.format("%Y-%m-%d %H:%M").to_string(),
        );
        lines.push(format!(
            "  {}  {} page(s) downloaded, {complete}/{groups} volume(s) complete, last update {updated}",
            manifest.root_id(),
            manifest.count_by_status(EntryStatus::Downloaded),
        ));
    }
    lines
}

/// Prints every recorded manga for `status` without an id.
pub(crate) fn print_library(manifests: &[Manifest], output_dir: &Path) {
    print_lines(&library_lines(manifests, output_dir));
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;
    use mangabook_core::{GroupReport, ManifestEntry};

    use super::*;

    #[test]
    fn test_truncate_to_width() {
        assert_eq!(truncate_to_width("abcdef", 10), "abcdef");
        assert_eq!(truncate_to_width("abcdef", 4), "abc…");
        assert_eq!(truncate_to_width("abcdef", 1), "…");
        assert_eq!(truncate_to_width("abcdef", 0), "");
    }

    fn report(state: GroupState) -> GroupReport {
        let mut report = GroupReport::new("1", "Volume 1");
        report.state = state;
        report
    }

    #[test]
    fn test_summary_separates_retryable_and_fatal_failures() {
        let mut group = report(GroupState::PartiallyFailed);
        group.downloaded = 4;
        group.failed_retryable = 2;
        group.failed_fatal = 1;
        group.needs_auth = true;
        let mut summary = RunSummary::new("root");
        summary.groups = vec![group];

        let lines = completion_summary_lines("Series", Path::new("/lib/Series"), &summary);
        let text = lines.join("\n");
        assert!(text.contains("4 pages downloaded"));
        assert!(text.contains("2 page(s) failed after retries; re-running may help."));
        assert!(text.contains("1 page(s) failed permanently"));
        assert!(text.contains("MANGABOOK_API_TOKEN"));
        assert!(!text.contains("Interrupted"));
    }

    #[test]
    fn test_summary_reports_interrupt_and_unavailable() {
        let mut group = report(GroupState::Unavailable);
        group.error = Some("HTTP 500".to_string());
        let mut summary = RunSummary::new("root");
        summary.groups = vec![group];
        summary.interrupted = true;

        let text = completion_summary_lines("Series", Path::new("/lib"), &summary).join("\n");
        assert!(text.contains("(HTTP 500)"));
        assert!(text.contains("1 volume(s) could not be listed."));
        assert!(text.contains("Interrupted. Run again to resume."));
    }

    #[test]
    fn test_status_lines_for_empty_manifest() {
        let manifest = Manifest::new("root");
        let lines = status_lines(&manifest, &PathBuf::from("/lib/.mangabook/manifests/root.json"));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("No downloads recorded for root"));
    }

    fn entry(unit_id: &str, downloaded_at: chrono::DateTime<Utc>) -> ManifestEntry {
        ManifestEntry {
            unit_id: unit_id.to_string(),
            group_id: "1".to_string(),
            local_path: PathBuf::from(format!("{unit_id}.png")),
            downloaded_at,
            remote_version: "v".to_string(),
            status: EntryStatus::Downloaded,
            retries: 0,
        }
    }

    #[test]
    fn test_library_lines_for_empty_library() {
        let lines = library_lines(&[], Path::new("/lib"));
        assert_eq!(lines, vec!["No downloads recorded in /lib.".to_string()]);
    }

    #[test]
    fn test_library_lines_list_newest_first() {
        let now = Utc::now();
        let mut older = Manifest::new("older-id");
        older.upsert(entry("a", now - chrono::Duration::days(2)));
        older.set_group_complete("1", true);
        let mut newer = Manifest::new("newer-id");
        newer.upsert(entry("b", now));
        newer.upsert(entry("c", now));
        newer.set_group_complete("1", false);

        let lines = library_lines(&[older, newer], Path::new("/lib"));

        assert_eq!(lines[0], "2 manga recorded in /lib");
        assert!(lines[1].contains("newer-id  2 page(s) downloaded, 0/1 volume(s) complete"));
        assert!(lines[2].contains("older-id  1 page(s) downloaded, 1/1 volume(s) complete"));
    }

    #[test]
    fn test_status_lines_count_entries_and_groups() {
        let mut manifest = Manifest::new("root");
        for (unit_id, status) in [
            ("c:1", EntryStatus::Downloaded),
            ("c:2", EntryStatus::Downloaded),
            ("c:3", EntryStatus::Failed),
        ] {
            manifest.upsert(ManifestEntry {
                unit_id: unit_id.to_string(),
                group_id: "1".to_string(),
                local_path: PathBuf::from(format!("{unit_id}.png")),
                downloaded_at: Utc::now(),
                remote_version: "v".to_string(),
                status,
                retries: 0,
            });
        }
        manifest.set_group_complete("2", true);
        manifest.set_group_complete("1", false);

        let text = status_lines(&manifest, Path::new("/m.json")).join("\n");
        assert!(text.contains("3 page(s) recorded"));
        assert!(text.contains("downloaded  2"));
        assert!(text.contains("failed      1"));
        assert!(text.contains("Volumes complete: 2"));
        assert!(text.contains("Volumes incomplete: 1"));
    }
}
