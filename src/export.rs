use crate::company::{CompanyRecord, LifecycleState};
use crate::store::WorkStore;
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

const HEADERS: [&str; 7] = [
    "Key",
    "Firma",
    "Ort",
    "Registergericht",
    "Natuerliche Personen",
    "Konfidenz",
    "Gesellschafter",
];

/// Write every qualified company to `output_path`, returning the row count
pub fn export_qualified(store: &WorkStore, output_path: &Path) -> Result<usize> {
    let records = store
        .list_by_state(LifecycleState::Qualified)
        .context("Failed to load qualified companies")?;

    debug!("Exporting {} qualified companies to CSV: {}", records.len(), output_path.display());

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create export directory: {}", parent.display()))?;
    }
    let file = File::create(output_path)
        .context(format!("Failed to create export file: {}", output_path.display()))?;
    write_csv(&records, file)?;

    info!("Exported {} qualified companies to {}", records.len(), output_path.display());
    Ok(records.len())
}

pub fn write_csv<W: Write>(records: &[CompanyRecord], writer: W) -> Result<()> {
    let mut wtr = WriterBuilder::new().delimiter(b';').from_writer(writer);
    wtr.write_record(HEADERS)?;

    for record in records {
        let (persons, names) = match &record.ownership {
            Some(ownership) => (
                ownership.natural_person_count().to_string(),
                ownership.natural_person_names().collect::<Vec<_>>().join(", "),
            ),
            None => (String::new(), String::new()),
        };
        let confidence = record.confidence.map(|c| format!("{:.2}", c)).unwrap_or_default();

        wtr.write_record([
            record.key.as_str(),
            record.name.as_str(),
            record.location.as_str(),
            record.court.as_deref().unwrap_or(""),
            persons.as_str(),
            confidence.as_str(),
            names.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
