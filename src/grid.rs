use std::fmt::Write;

use colored::Colorize;

use crate::runner::Progress;

const TITLE: &str = "Signature Graphics Test";
const COLUMNS: usize = 3;

pub fn title(progress: &Progress) -> String {
    if progress.is_done() {
        format!("{TITLE} - finished")
    } else {
        match progress.cursor {
            Some(cursor) if cursor > 0 => format!("{TITLE} ({cursor}/{})", progress.total),
            _ => TITLE.to_owned(),
        }
    }
}

/// Title, the artifacts in rows of three with their outcome, and a summary.
pub fn render(artifacts: &[String], progress: &Progress) -> String {
    let labels = artifacts
        .iter()
        .map(|a| a.strip_suffix(".png").unwrap_or(a))
        .collect::<Vec<_>>();
    let width = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "{}", title(progress).bold());
    let _ = writeln!(out);

    for (row_start, row) in labels.chunks(COLUMNS).enumerate() {
        let mut line = String::new();
        for (column, label) in row.iter().enumerate() {
            let index = row_start * COLUMNS + column;
            let marker = match progress.results.get(&index) {
                Some(true) => "✔".green().to_string(),
                Some(false) => "✘".red().to_string(),
                None => " ".to_owned(),
            };
            let _ = write!(line, "{:3}. {marker} {label:<width$}  ", index + 1);
        }
        let _ = writeln!(out, "{}", line.trim_end());
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} passed, {} failed, {} pending",
        progress.passed().to_string().green(),
        progress.failed().to_string().red(),
        progress.total - progress.results.len()
    );
    out
}
