//! History command implementation.

use anyhow::{Context, Result};
use easyshare_core::storage::{Storage, TransferKind};

use super::{format_size, open_storage, HistoryArgs};

/// Run the history command.
pub fn run(args: &HistoryArgs) -> Result<()> {
    let storage = open_storage()?;

    if args.clear {
        storage.clear_transfers().context("failed to clear history")?;
        println!("History cleared.");
        return Ok(());
    }

    let transfers = storage.transfers().context("failed to read history")?;
    if transfers.is_empty() {
        println!("No transfers yet.");
        return Ok(());
    }

    let limit = args.limit.unwrap_or(transfers.len());
    for record in transfers.iter().take(limit) {
        let when = chrono::DateTime::from_timestamp_millis(record.timestamp)
            .map_or_else(|| "unknown".to_string(), format_time_ago);
        match &record.kind {
            TransferKind::Text { content } => {
                let preview: String = content.chars().take(48).collect();
                println!(
                    "{when:16}  {:7}  {:16}  \"{preview}\"",
                    record.direction.to_string(),
                    record.device_name
                );
            }
            TransferKind::File {
                file_name,
                file_size,
                ..
            } => {
                println!(
                    "{when:16}  {:7}  {:16}  {file_name} ({})",
                    record.direction.to_string(),
                    record.device_name,
                    format_size(*file_size)
                );
            }
        }
    }
    Ok(())
}

fn format_time_ago(timestamp: chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let duration = now.signed_duration_since(timestamp);

    if duration.num_days() > 0 {
        let days = duration.num_days();
        if days == 1 {
            "1 day ago".to_string()
        } else {
            format!("{days} days ago")
        }
    } else if duration.num_hours() > 0 {
        let hours = duration.num_hours();
        if hours == 1 {
            "1 hour ago".to_string()
        } else {
            format!("{hours} hours ago")
        }
    } else if duration.num_minutes() > 0 {
        let minutes = duration.num_minutes();
        if minutes == 1 {
            "1 minute ago".to_string()
        } else {
            format!("{minutes} minutes ago")
        }
    } else {
        "just now".to_string()
    }
}
