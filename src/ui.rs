//! Terminal output helpers: colored statuses and listing lines.

use std::collections::BTreeMap;

use console::Style;

use crate::model::{Folder, Job, JobId, SubJobStatus};

/// Color for one status, matching the usual scheduler conventions.
fn style_for(status: SubJobStatus) -> Style {
    match status {
        SubJobStatus::Done => Style::new().green(),
        SubJobStatus::Failed => Style::new().red().bold(),
        SubJobStatus::Killed => Style::new().red(),
        SubJobStatus::Running => Style::new().cyan(),
        SubJobStatus::Pending | SubJobStatus::Submitted => Style::new().yellow(),
        SubJobStatus::Created | SubJobStatus::Unknown => Style::new().dim(),
    }
}

pub fn styled_status(status: SubJobStatus) -> String {
    style_for(status).apply_to(status).to_string()
}

/// Collapses per-subjob statuses into `status xN` groups, e.g.
/// `done x2, failed`.
pub fn summarize_statuses(statuses: &[SubJobStatus]) -> String {
    let mut counts: BTreeMap<String, (SubJobStatus, usize)> = BTreeMap::new();
    for &status in statuses {
        counts
            .entry(status.to_string())
            .and_modify(|(_, n)| *n += 1)
            .or_insert((status, 1));
    }
    counts
        .values()
        .map(|&(status, n)| {
            if n == 1 {
                styled_status(status)
            } else {
                format!("{} x{n}", styled_status(status))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn print_folder(folder: &Folder) {
    println!("{}/", Style::new().blue().bold().apply_to(&folder.name));
}

pub fn print_job(job: &Job, statuses: Option<&[SubJobStatus]>) {
    let summary = match statuses {
        Some(s) => summarize_statuses(s),
        None if job.is_submitted() => styled_status(SubJobStatus::Submitted),
        None => styled_status(SubJobStatus::Created),
    };
    let mut line = format!("{:>6}  {}  {}", job.id, summary, job.command);
    if let Some(orig) = job.resubmitted_from {
        line.push_str(&format!("  (resubmitted from {orig})"));
    }
    if let Some(new) = job.superseded_by {
        line.push_str(&format!("  (superseded by {new})"));
    }
    println!("{line}");
}

pub fn print_status_line(job_id: JobId, statuses: &[SubJobStatus]) {
    println!("{job_id:>6}  {}", summarize_statuses(statuses));
}

pub fn print_empty_target(expr: &str) {
    eprintln!(
        "{} no jobs in target '{expr}'",
        Style::new().yellow().apply_to("warning:")
    );
}

pub fn print_unresolved(tokens: &[String]) {
    for token in tokens {
        eprintln!(
            "{} target '{token}' matched nothing",
            Style::new().yellow().apply_to("warning:")
        );
    }
}
