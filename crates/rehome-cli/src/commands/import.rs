use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use rehome_engine::resolve::create_state_backend;
use rehome_state::RecordStore;
use rehome_types::FileRecord;

/// Execute the `import` command: load JSON-lines records into the store.
///
/// Records whose id is already present are left untouched, so re-importing
/// an export never resets migration progress.
pub fn execute(job_path: &Path, records_path: &Path, batch_size: usize) -> Result<()> {
    let config = super::load_job(job_path)?;
    let store = create_state_backend(&config.state)?;
    let file = File::open(records_path)
        .with_context(|| format!("Failed to open records file: {}", records_path.display()))?;

    let (read, inserted) = import_lines(BufReader::new(file), store.as_ref(), batch_size.max(1))?;
    tracing::info!(read, inserted, "Import finished");
    println!("Imported {inserted} new records ({read} read).");
    Ok(())
}

fn import_lines<S: RecordStore + ?Sized>(
    reader: impl BufRead,
    store: &S,
    batch_size: usize,
) -> Result<(u64, u64)> {
    let mut batch = Vec::with_capacity(batch_size);
    let (mut read, mut inserted) = (0u64, 0u64);

    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read records file")?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FileRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {}", idx + 1))?;
        batch.push(record);
        read += 1;
        if batch.len() >= batch_size {
            inserted += store.insert_records(&batch).context("Failed to insert records")?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        inserted += store.insert_records(&batch).context("Failed to insert records")?;
    }
    Ok((read, inserted))
}
