//! List sessions.

use anyhow::Result;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "PROJECT")]
    project: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "STARTED")]
    started: String,
}

pub async fn execute() -> Result<()> {
    let manager = faize::new_manager()?;
    let sessions = manager.list().await?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            id: s.id.clone(),
            project: s.project_dir.display().to_string(),
            status: s.status.to_string(),
            started: s.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::blank()));
    Ok(())
}
