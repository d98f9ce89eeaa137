use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};

use crate::ingest::{TickReport, TickStage};
use crate::snapshot::{to_display, Snapshot};

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn render_current_table(board: &str, snapshot: Option<&Snapshot>) -> String {
    let Some(snapshot) = snapshot else {
        return format!("{board}: no data yet");
    };
    let mut table = new_table();
    table.set_header(vec!["Candidate", "Percent"]);
    let mut ranked: Vec<_> = snapshot.candidates.iter().collect();
    ranked.sort_by(|a, b| b.percent.total_cmp(&a.percent));
    for (i, candidate) in ranked.iter().enumerate() {
        let name = if i == 0 {
            Cell::new(&candidate.name).fg(Color::Green)
        } else {
            Cell::new(&candidate.name)
        };
        table.add_row(Row::from(vec![
            name,
            Cell::new(format!("{:.2}%", candidate.percent)),
        ]));
    }
    format!(
        "{board} @ {}\n{table}",
        to_display(&snapshot.timestamp)
    )
}

/// One row per snapshot, one column per candidate seen anywhere in the range.
pub fn render_history_table(snapshots: &[Snapshot]) -> String {
    let mut names: Vec<&str> = snapshots
        .iter()
        .flat_map(|s| s.candidates.iter().map(|c| c.name.as_str()))
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut table = new_table();
    let mut header = vec!["Timestamp".to_string()];
    header.extend(names.iter().map(|n| n.to_string()));
    table.set_header(header);

    for snapshot in snapshots {
        let mut row = vec![Cell::new(to_display(&snapshot.timestamp))];
        for name in &names {
            let value = snapshot
                .candidates
                .iter()
                .find(|c| c.name == *name)
                .map(|c| format!("{:.2}", c.percent))
                .unwrap_or_else(|| "-".to_string());
            row.push(Cell::new(value));
        }
        table.add_row(Row::from(row));
    }
    table.to_string()
}

pub fn render_tick_table(report: &TickReport) -> String {
    let mut table = new_table();
    table.set_header(vec!["Board", "Result"]);
    for board in &report.boards_fetched {
        table.add_row(Row::from(vec![
            Cell::new(board),
            Cell::new("fetched").fg(Color::Green),
        ]));
    }
    for failure in &report.failures {
        table.add_row(Row::from(vec![
            Cell::new(&failure.board),
            Cell::new(&failure.error).fg(Color::Red),
        ]));
    }
    let outcome = match report.stage {
        TickStage::Done => format!("{} rows written", report.rows_written),
        TickStage::Failed => "no rows written".to_string(),
        other => format!("stopped while {other:?}").to_lowercase(),
    };
    format!("tick {}: {outcome}\n{table}", report.started_at)
}
