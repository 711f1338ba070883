use std::path::Path;

use anyhow::{Context, Result, anyhow};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use tracing::{debug, info, warn};

use crate::encoding::read_to_utf8;

pub const PROMPT_COLUMN: &str = "Prompt";
pub const RESPONSE_COLUMN: &str = "Response";

/// One row of fine-tuning data. Either side can be missing, since that's
/// what a messy spreadsheet export tends to look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub prompt: Option<String>,
    pub response: Option<String>,
}

impl PromptPair {
    pub fn new(prompt: &str, response: &str) -> Self {
        Self {
            prompt: Some(prompt.to_owned()),
            response: Some(response.to_owned()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.prompt.is_some() && self.response.is_some()
    }
}

/// How many rows survived parsing, and how many didn't.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: usize,
    pub skipped: usize,
}

pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<(Vec<PromptPair>, LoadStats)> {
    let path = path.as_ref();
    info!("Loading CSV file: {}", path.display());
    let decoded = read_to_utf8(path)?;
    let (pairs, stats) = parse_csv(&decoded.text)?;
    if stats.skipped > 0 {
        warn!("Skipped {} malformed line(s).", stats.skipped);
    }
    info!("CSV loaded with {} rows after cleaning.", stats.rows);
    Ok((pairs, stats))
}

/// Parses CSV text into prompt/response pairs, keeping only those two columns.
///
/// Rows with more fields than the header are dropped, while rows with fewer
/// fields are kept with the missing cells set to `None`. Empty cells and
/// the usual spellings of "not available" (see [`MISSING_VALUES`]) are also
/// `None`.
pub fn parse_csv(text: &str) -> Result<(Vec<PromptPair>, LoadStats)> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers().context("unable to read CSV header")?.clone();
    let prompt_idx = find_column(&headers, PROMPT_COLUMN)?;
    let response_idx = find_column(&headers, RESPONSE_COLUMN)?;

    let mut pairs = vec![];
    let mut stats = LoadStats::default();
    for (line, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                debug!("skipping unparseable row {}: {err}", line + 2);
                stats.skipped += 1;
                continue;
            }
        };
        if record.len() > headers.len() {
            debug!(
                "skipping row {}: expected {} fields, saw {}",
                line + 2,
                headers.len(),
                record.len()
            );
            stats.skipped += 1;
            continue;
        }
        pairs.push(PromptPair {
            prompt: cell(&record, prompt_idx),
            response: cell(&record, response_idx),
        });
    }
    stats.rows = pairs.len();

    Ok((pairs, stats))
}

fn find_column(headers: &StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|header| header.trim_start_matches('\u{feff}').trim() == name)
        .ok_or_else(|| anyhow!("CSV has no '{name}' column (columns are {headers:?})"))
}

/// Cell values that count as missing, the same set pandas' `read_csv`
/// treats as NA by default. Matching is exact, with no trimming.
pub const MISSING_VALUES: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

fn cell(record: &StringRecord, idx: usize) -> Option<String> {
    record
        .get(idx)
        .filter(|value| !MISSING_VALUES.contains(value))
        .map(str::to_owned)
}

pub fn write_clean_csv<P: AsRef<Path>>(pairs: &[PromptPair], path: P) -> Result<()> {
    let path = path.as_ref();
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("unable to create {}", path.display()))?;
    writer.write_record([PROMPT_COLUMN, RESPONSE_COLUMN])?;
    for pair in pairs {
        writer.write_record([
            pair.prompt.as_deref().unwrap_or(""),
            pair.response.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    info!("Cleaned CSV saved as '{}'.", path.display());
    Ok(())
}
