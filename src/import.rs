//! Company list import from CSV exports and Excel workbooks
//!
//! Supports:
//! - `;`, `,` and tab delimited files (sniffed from the first line)
//! - `.xlsx` workbooks (first worksheet)
//! - German and English column headers, or no header at all
//! - Register numbers in the usual free-text forms (`Amtsgericht Berlin HRB 1 B`)
//! - UTF-8 (with or without BOM) and Latin-1 encoded files

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook, Data, Reader, Xlsx};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::company::{NewCompany, RegisterNumber};

const NAME_COLUMNS: &[&str] = &["firma", "firmenname", "name", "company", "company name"];
const LOCATION_COLUMNS: &[&str] = &["ort", "stadt", "city", "location"];
const COURT_COLUMNS: &[&str] = &["registergericht", "district court", "gericht", "court"];
const REGISTER_COLUMNS: &[&str] = &["registernummer", "register number", "hrb", "hra"];

const CANDIDATE_DELIMITERS: [u8; 3] = [b';', b',', b'\t'];

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm"];

/// A row that could not be imported, with its 1-based line number
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImportBatch {
    pub companies: Vec<NewCompany>,
    pub skipped: Vec<SkippedRow>,
    /// Field delimiter of a CSV import; `None` for workbooks
    pub delimiter: Option<u8>,
    pub had_header: bool,
}

/// Column positions resolved from the header row
#[derive(Debug, Clone, Copy, PartialEq)]
struct Columns {
    name: Option<usize>,
    location: Option<usize>,
    court: Option<usize>,
    register: Option<usize>,
}

impl Columns {
    /// Headerless files are read as name, location, court, register
    fn positional() -> Self {
        Self {
            name: Some(0),
            location: Some(1),
            court: Some(2),
            register: Some(3),
        }
    }

    fn from_header(header: &csv::StringRecord) -> Option<Self> {
        let labels: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
        let find = |aliases: &[&str]| aliases.iter().find_map(|alias| labels.iter().position(|l| l == alias));

        let columns = Self {
            name: find(NAME_COLUMNS),
            location: find(LOCATION_COLUMNS),
            court: find(COURT_COLUMNS),
            register: find(REGISTER_COLUMNS),
        };

        if columns.name.is_some() || columns.register.is_some() {
            Some(columns)
        } else {
            None
        }
    }
}

/// Read and parse an import file, a workbook when the extension says so
pub fn read_company_file(path: &Path, preferred_delimiter: Option<u8>) -> Result<ImportBatch> {
    let is_workbook = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| WORKBOOK_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
    if is_workbook {
        return read_company_workbook(path);
    }

    let bytes = fs::read(path).context(format!("Failed to read import file: {}", path.display()))?;
    let content = decode(&bytes);
    parse_company_csv(&content, preferred_delimiter)
        .context(format!("Failed to parse import file: {}", path.display()))
}

/// Parse CSV content into companies, skipping rows without a usable name or
/// register number
pub fn parse_company_csv(content: &str, preferred_delimiter: Option<u8>) -> Result<ImportBatch> {
    let content = content.trim_start_matches('\u{feff}');
    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let delimiter = sniff_delimiter(first_line, preferred_delimiter);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(content.as_bytes());

    let rows = reader.records().enumerate().map(|(index, result)| -> Result<(usize, csv::StringRecord)> {
        let record = result.context("Failed to read CSV record")?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(index + 1);
        Ok((line, record))
    });

    let mut batch = ImportBatch {
        delimiter: Some(delimiter),
        ..ImportBatch::default()
    };
    collect_companies(rows, &mut batch)?;

    info!(
        "Parsed {} companies from CSV ({} skipped, delimiter {:?})",
        batch.companies.len(),
        batch.skipped.len(),
        delimiter as char
    );
    Ok(batch)
}

/// Read companies from the first worksheet of an Excel workbook
pub fn read_company_workbook(path: &Path) -> Result<ImportBatch> {
    let mut workbook: Xlsx<_> = open_workbook(path)
        .map_err(|e| anyhow!("Failed to open workbook {}: {}", path.display(), e))?;
    let (sheet, range) = workbook
        .worksheets()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Workbook {} has no worksheets", path.display()))?;

    // Line numbers count from the top of the sheet, as Excel shows them
    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    let rows = range.rows().enumerate().map(|(index, cells)| -> Result<(usize, csv::StringRecord)> {
        let fields: Vec<String> = cells.iter().map(cell_text).collect();
        Ok((first_row + index + 1, csv::StringRecord::from(fields)))
    });

    let mut batch = ImportBatch::default();
    collect_companies(rows, &mut batch)?;

    info!(
        "Parsed {} companies from worksheet '{}' ({} skipped)",
        batch.companies.len(),
        sheet,
        batch.skipped.len()
    );
    Ok(batch)
}

/// Register numbers typed as numbers come back as floats
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Float(value) if value.fract() == 0.0 => format!("{}", *value as i64),
        other => other.to_string(),
    }
}

/// Header detection and row conversion shared by every import format
fn collect_companies<I>(rows: I, batch: &mut ImportBatch) -> Result<()>
where
    I: IntoIterator<Item = Result<(usize, csv::StringRecord)>>,
{
    let mut columns = None;

    for row in rows {
        let (line, record) = row?;

        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let cols = match columns {
            Some(cols) => cols,
            None => match Columns::from_header(&record) {
                Some(cols) => {
                    debug!("Import header detected: {:?}", cols);
                    batch.had_header = true;
                    columns = Some(cols);
                    continue;
                }
                None => {
                    let cols = Columns::positional();
                    columns = Some(cols);
                    cols
                }
            },
        };

        match company_from_record(&record, &cols) {
            Ok(company) => batch.companies.push(company),
            Err(reason) => {
                debug!("Skipping import line {}: {}", line, reason);
                batch.skipped.push(SkippedRow { line, reason });
            }
        }
    }

    if batch.had_header && columns.is_some_and(|c| c.register.is_none()) {
        warn!("Import file has no register number column; every row will be skipped");
    }
    Ok(())
}

fn company_from_record(record: &csv::StringRecord, columns: &Columns) -> Result<NewCompany, String> {
    let field = |idx: Option<usize>| {
        idx.and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let name = field(columns.name).ok_or_else(|| "missing company name".to_string())?;
    let register_raw = field(columns.register).ok_or_else(|| format!("{}: missing register number", name))?;
    let register = RegisterNumber::parse(register_raw)
        .ok_or_else(|| format!("{}: unparseable register number '{}'", name, register_raw))?;
    let location = field(columns.location).unwrap_or("");

    let court = field(columns.court)
        .map(str::to_string)
        .or_else(|| RegisterNumber::court_prefix(register_raw))
        .or_else(|| court_for_city(location).map(str::to_string));

    Ok(NewCompany::new(name, location, court.as_deref(), register))
}

/// The preferred delimiter wins when it occurs in the first line, otherwise
/// the most frequent candidate
fn sniff_delimiter(first_line: &str, preferred: Option<u8>) -> u8 {
    let count = |d: u8| first_line.bytes().filter(|b| *b == d).count();

    if let Some(preferred) = preferred {
        if count(preferred) > 0 {
            return preferred;
        }
    }

    CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .max_by_key(|d| count(*d))
        .filter(|d| count(*d) > 0)
        .unwrap_or(b';')
}

/// Register court seated in a large city, used when a row names none
pub fn court_for_city(city: &str) -> Option<&'static str> {
    let city = city.trim().to_lowercase();
    let court = match city.as_str() {
        "berlin" => "Berlin (Charlottenburg)",
        "münchen" | "munich" => "München",
        "hamburg" => "Hamburg",
        "frankfurt" | "frankfurt am main" => "Frankfurt am Main",
        "köln" | "cologne" => "Köln",
        "düsseldorf" => "Düsseldorf",
        "stuttgart" => "Stuttgart",
        "dortmund" => "Dortmund",
        "essen" => "Essen",
        "bremen" => "Bremen",
        "leipzig" => "Leipzig",
        "dresden" => "Dresden",
        "hannover" => "Hannover",
        "nürnberg" | "nuremberg" => "Nürnberg",
        _ => return None,
    };
    Some(court)
}

fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
