//! Maps spreadsheet rows of varying shape onto [`CensusRecord`].
//!
//! Count cells go through [`parse_count`], which never fails: anything that is
//! not a non-negative integer is repaired to a usable count and the repair is
//! reported instead of raised.

use crate::config::ColumnConfig;
use crate::types::{
    CellValue, CensusRecord, RawRow, UNSPECIFIED_AGE_GROUP, UNSPECIFIED_COMUNA,
    UNSPECIFIED_REGION,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Value was already a clean non-negative integer.
    None,
    /// Fractional number or trailing text was cut back to its integer part.
    Truncated,
    /// Missing, negative or non-numeric; replaced with 0.
    Zeroed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedCount {
    pub value: u64,
    pub repair: Repair,
}

impl ParsedCount {
    fn clean(value: u64) -> Self {
        Self { value, repair: Repair::None }
    }

    fn zeroed() -> Self {
        Self { value: 0, repair: Repair::Zeroed }
    }
}

/// Parse a count cell. Absent cells are 0 without counting as a repair.
pub fn parse_count(cell: Option<&CellValue>) -> ParsedCount {
    match cell {
        None => ParsedCount::clean(0),
        Some(CellValue::Number(n)) => {
            if !n.is_finite() || *n < 0.0 {
                ParsedCount::zeroed()
            } else if n.fract() == 0.0 {
                ParsedCount::clean(*n as u64)
            } else {
                ParsedCount { value: n.trunc() as u64, repair: Repair::Truncated }
            }
        }
        Some(CellValue::Text(s)) => parse_count_text(s),
    }
}

// Leading-integer semantics: "12" -> 12, "12.7" -> 12, "12 personas" -> 12,
// "abc" -> 0, "-4" -> 0.
fn parse_count_text(text: &str) -> ParsedCount {
    let s = text.trim();
    if s.is_empty() {
        return ParsedCount::clean(0);
    }
    let digits = s.strip_prefix('+').unwrap_or(s);
    let prefix: &str = &digits[..digits.bytes().take_while(u8::is_ascii_digit).count()];
    if prefix.is_empty() {
        return ParsedCount::zeroed();
    }
    match prefix.parse::<u64>() {
        Ok(value) if prefix.len() == digits.len() => ParsedCount::clean(value),
        Ok(value) => ParsedCount { value, repair: Repair::Truncated },
        Err(_) => ParsedCount::zeroed(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub rows: usize,
    pub truncated_cells: usize,
    pub zeroed_cells: usize,
}

impl NormalizeReport {
    fn record(&mut self, parsed: ParsedCount) {
        match parsed.repair {
            Repair::None => {}
            Repair::Truncated => self.truncated_cells += 1,
            Repair::Zeroed => self.zeroed_cells += 1,
        }
    }

    pub fn repaired_cells(&self) -> usize {
        self.truncated_cells + self.zeroed_cells
    }
}

pub struct Normalizer {
    columns: ColumnConfig,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(ColumnConfig::default())
    }
}

impl Normalizer {
    pub fn new(columns: ColumnConfig) -> Self {
        Self { columns }
    }

    /// One record per row, same order.
    pub fn normalize<'a, I>(&self, rows: I) -> (Vec<CensusRecord>, NormalizeReport)
    where
        I: IntoIterator<Item = &'a RawRow>,
    {
        let mut report = NormalizeReport::default();
        let records: Vec<CensusRecord> = rows
            .into_iter()
            .map(|row| self.normalize_row(row, &mut report))
            .collect();
        report.rows = records.len();

        if report.repaired_cells() > 0 {
            debug!(
                rows = report.rows,
                truncated = report.truncated_cells,
                zeroed = report.zeroed_cells,
                "repaired malformed count cells"
            );
        }
        (records, report)
    }

    fn normalize_row(&self, row: &RawRow, report: &mut NormalizeReport) -> CensusRecord {
        let male = parse_count(lookup(row, &self.columns.male));
        let female = parse_count(lookup(row, &self.columns.female));
        report.record(male);
        report.record(female);

        let census_population = lookup(row, &self.columns.census_population).map(|cell| {
            let parsed = parse_count(Some(cell));
            report.record(parsed);
            parsed.value
        });

        CensusRecord::new(
            text_or(row, &self.columns.region, UNSPECIFIED_REGION),
            text_or(row, &self.columns.comuna, UNSPECIFIED_COMUNA),
            text_or(row, &self.columns.age_group, UNSPECIFIED_AGE_GROUP),
            male.value,
            female.value,
            census_population,
        )
    }
}

/// First alias with a non-blank cell wins.
fn lookup<'a>(row: &'a RawRow, aliases: &[String]) -> Option<&'a CellValue> {
    aliases
        .iter()
        .filter_map(|alias| row.get(alias))
        .find(|cell| !cell.is_blank())
}

fn text_or(row: &RawRow, aliases: &[String], default: &str) -> String {
    lookup(row, aliases)
        .map(|cell| cell.to_string().trim().to_string())
        .unwrap_or_else(|| default.to_string())
}
