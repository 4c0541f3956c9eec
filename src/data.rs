use crate::types::{CellValue, RawRow};
use anyhow::{Context, Result, anyhow};
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use csv::ReaderBuilder;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetFormat {
    Csv,
    /// Anything calamine opens: xlsx, xlsm, xlsb, xls, ods.
    Workbook,
}

impl SpreadsheetFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension()
            .and_then(|e| e.to_str())
            .map(|s: &str| s.to_lowercase())
            .ok_or_else(|| anyhow!("Spreadsheet file has no extension: {:?}", path))?;
        Self::from_extension(&extension)
    }

    pub fn from_extension(extension: &str) -> Result<Self> {
        match extension.to_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Ok(SpreadsheetFormat::Csv),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(SpreadsheetFormat::Workbook),
            other => Err(anyhow!("Unsupported spreadsheet format: {}", other)),
        }
    }
}

pub fn load_rows(path: &Path) -> Result<Vec<RawRow>> {
    let format = SpreadsheetFormat::from_path(path)?;
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read spreadsheet: {:?}", path))?;
    let rows = read_rows(&bytes, format)?;
    info!(path = ?path, rows = rows.len(), "loaded spreadsheet");
    Ok(rows)
}

/// Parse the first worksheet (or the whole CSV) into header-keyed rows.
/// The first row is the header row; fully blank rows are skipped.
pub fn read_rows(bytes: &[u8], format: SpreadsheetFormat) -> Result<Vec<RawRow>> {
    match format {
        SpreadsheetFormat::Csv => read_csv_rows(bytes),
        SpreadsheetFormat::Workbook => read_workbook_rows(bytes),
    }
}

fn read_csv_rows(bytes: &[u8]) -> Result<Vec<RawRow>> {
    let content = decode_text(bytes);
    let delimiter = sniff_delimiter(content.lines().next().unwrap_or(""));

    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = rdr.headers().context("Failed to read CSV header row")?.clone();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.context("Malformed CSV record")?;
        let row: RawRow = headers.iter()
            .zip(record.iter())
            .filter(|(h, v)| !h.trim().is_empty() && !v.trim().is_empty())
            .map(|(h, v)| (h.trim().to_string(), CellValue::Text(v.trim().to_string())))
            .collect();
        if !row.is_empty() {
            rows.push(row);
        }
    }

    debug!(rows = rows.len(), delimiter = %(delimiter as char), "parsed CSV");
    Ok(rows)
}

// Excel-exported CSVs are often Windows-1252 rather than UTF-8.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Pick the candidate that splits the header line into the most fields.
fn sniff_delimiter(header_line: &str) -> u8 {
    [b',', b';', b'\t', b'|']
        .into_iter()
        .map(|d| (d, header_line.bytes().filter(|&b| b == d).count()))
        .fold((b',', 0), |best, cand| if cand.1 > best.1 { cand } else { best })
        .0
}

fn read_workbook_rows(bytes: &[u8]) -> Result<Vec<RawRow>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| anyhow!("Failed to open workbook: {}", e))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("Workbook has no worksheets"))?
        .map_err(|e| anyhow!("Failed to read first worksheet: {}", e))?;

    let mut sheet_rows = range.rows();
    let headers: Vec<String> = match sheet_rows.next() {
        Some(header) => header.iter().map(|c| c.to_string().trim().to_string()).collect(),
        None => return Ok(Vec::new()),
    };

    let mut rows = Vec::new();
    for sheet_row in sheet_rows {
        let mut row = RawRow::new();
        for (label, cell) in headers.iter().zip(sheet_row.iter()) {
            if label.is_empty() {
                continue;
            }
            if let Some(value) = cell_value(cell) {
                row.insert(label.clone(), value);
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }

    debug!(rows = rows.len(), "parsed workbook");
    Ok(rows)
}

fn cell_value(cell: &Data) -> Option<CellValue> {
    match cell {
        Data::Empty => None,
        Data::String(s) if s.trim().is_empty() => None,
        Data::String(s) => Some(CellValue::Text(s.trim().to_string())),
        Data::Float(f) => Some(CellValue::Number(*f)),
        Data::Int(i) => Some(CellValue::Number(*i as f64)),
        Data::Bool(b) => Some(CellValue::Text(b.to_string())),
        other => Some(CellValue::Text(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;

    #[test]
    fn csv_rows_keep_order_and_skip_blank_cells() {
        let csv = "region,comuna,hombres,mujeres\nRegión X,A,10,5\nRegión Y,,3,abc\n";
        let rows = read_rows(csv.as_bytes(), SpreadsheetFormat::Csv).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], CellValue::Text("Región X".into()));
        assert_eq!(rows[1]["region"], CellValue::Text("Región Y".into()));
        assert!(!rows[1].contains_key("comuna"));
        assert_eq!(rows[1]["mujeres"], CellValue::Text("abc".into()));
    }

    #[test]
    fn semicolon_csv_is_detected() {
        let csv = "region;hombres;mujeres\nR1;1;2\n";
        let rows = read_rows(csv.as_bytes(), SpreadsheetFormat::Csv).unwrap();
        assert_eq!(rows[0]["hombres"], CellValue::Text("1".into()));
    }

    #[test]
    fn windows_1252_csv_is_decoded() {
        // "Región" with 0xF3 for ó
        let mut bytes = b"region\nRegi".to_vec();
        bytes.push(0xF3);
        bytes.extend_from_slice(b"n Sur\n");
        let rows = read_rows(&bytes, SpreadsheetFormat::Csv).unwrap();
        assert_eq!(rows[0]["region"], CellValue::Text("Región Sur".into()));
    }

    #[test]
    fn xlsx_first_sheet_is_read() {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "region").unwrap();
        sheet.write_string(0, 1, "hombres").unwrap();
        sheet.write_string(1, 0, "Región X").unwrap();
        sheet.write_number(1, 1, 25.0).unwrap();
        sheet.write_string(2, 0, "Región Y").unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let rows = read_rows(&bytes, SpreadsheetFormat::Workbook).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["hombres"], CellValue::Number(25.0));
        assert!(!rows[1].contains_key("hombres"));
    }

    #[test]
    fn garbage_workbook_is_an_error() {
        assert!(read_rows(b"definitely not a zip", SpreadsheetFormat::Workbook).is_err());
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(SpreadsheetFormat::from_path(Path::new("TABLA.XLSX")).unwrap(), SpreadsheetFormat::Workbook);
        assert_eq!(SpreadsheetFormat::from_path(Path::new("t.csv")).unwrap(), SpreadsheetFormat::Csv);
        assert!(SpreadsheetFormat::from_path(Path::new("t.pdf")).is_err());
        assert!(SpreadsheetFormat::from_path(Path::new("noext")).is_err());
    }
}
