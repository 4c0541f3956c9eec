//! File exports of the active dataset and its charts.

use crate::render::{self, ChartKind, ChartOptions, RenderedChart};
use crate::state::{ChartData, TABLE_HEADERS};
use crate::types::CensusRecord;
use anyhow::{Context, Result, anyhow};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use rust_xlsxwriter::Workbook;
use serde::Deserialize;
use std::borrow::Borrow;

// A4 in PDF points.
const A4_WIDTH: i64 = 595;
const A4_HEIGHT: i64 = 842;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Png,
    Pdf,
}

impl ExportFormat {
    pub fn default_file_name(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "Datacensus_Reporte.csv",
            ExportFormat::Xlsx => "Datacensus_Reporte.xlsx",
            ExportFormat::Png => "Datacensus_Grafico.png",
            ExportFormat::Pdf => "Datacensus_Reporte.pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ExportFormat::Png => "image/png",
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" | "excel" => Ok(ExportFormat::Xlsx),
            "png" => Ok(ExportFormat::Png),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(anyhow!("Unknown export format: {}", other)),
        }
    }
}

fn cells(r: &CensusRecord) -> [String; 7] {
    [
        r.region().to_string(),
        r.comuna().to_string(),
        r.age_group().to_string(),
        r.male_count().to_string(),
        r.female_count().to_string(),
        r.census_population().map(|p| p.to_string()).unwrap_or_default(),
        r.total_count().to_string(),
    ]
}

pub fn to_csv<R: Borrow<CensusRecord>>(records: &[R]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(TABLE_HEADERS)?;
    for r in records {
        wtr.write_record(cells(r.borrow()))?;
    }
    wtr.into_inner().map_err(|e| anyhow!("Failed to finish CSV: {}", e))
}

pub fn to_xlsx<R: Borrow<CensusRecord>>(records: &[R]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Datos")?;

    for (col, header) in TABLE_HEADERS.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }
    for (i, r) in records.iter().enumerate() {
        let r = r.borrow();
        let row = (i + 1) as u32;
        sheet.write_string(row, 0, r.region())?;
        sheet.write_string(row, 1, r.comuna())?;
        sheet.write_string(row, 2, r.age_group())?;
        sheet.write_number(row, 3, r.male_count() as f64)?;
        sheet.write_number(row, 4, r.female_count() as f64)?;
        if let Some(p) = r.census_population() {
            sheet.write_number(row, 5, p as f64)?;
        }
        sheet.write_number(row, 6, r.total_count() as f64)?;
    }

    let buffer = workbook.save_to_buffer().context("Failed to write XLSX")?;
    Ok(buffer)
}

pub fn to_png(kind: ChartKind, charts: &ChartData, options: ChartOptions) -> Result<Vec<u8>> {
    render::render_png(kind, charts, options)
}

/// A4 report with one chart per page, each scaled to the page width.
pub fn to_pdf(charts: &ChartData, kinds: &[ChartKind], options: ChartOptions) -> Result<Vec<u8>> {
    if kinds.is_empty() {
        return Err(anyhow!("PDF export needs at least one chart"));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut page_ids = Vec::with_capacity(kinds.len());

    for kind in kinds {
        let chart = render::render_chart(*kind, charts, options)?;
        let page_id = add_chart_page(&mut doc, pages_id, &chart)?;
        page_ids.push(Object::Reference(page_id));
    }

    let count = page_ids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut out = Vec::new();
    doc.save_to(&mut out).context("Failed to write PDF")?;
    Ok(out)
}

// Largest size with the chart's aspect ratio that fits on the page.
fn fit_to_page(width: i64, height: i64) -> (i64, i64) {
    let (width, height) = (width.max(1), height.max(1));
    let scaled_height = height * A4_WIDTH / width;
    if scaled_height <= A4_HEIGHT {
        (A4_WIDTH, scaled_height)
    } else {
        (width * A4_HEIGHT / height, A4_HEIGHT)
    }
}

fn add_chart_page(doc: &mut Document, pages_id: lopdf::ObjectId, chart: &RenderedChart) -> Result<lopdf::ObjectId> {
    let image = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => chart.width as i64,
            "Height" => chart.height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        chart.rgb.clone(),
    );
    let image_id = doc.add_object(image);

    let (width, height) = fit_to_page(chart.width as i64, chart.height as i64);
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Integer(width),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(height),
                    Object::Integer((A4_WIDTH - width) / 2),
                    Object::Integer(A4_HEIGHT - height),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        },
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(A4_WIDTH),
            Object::Integer(A4_HEIGHT),
        ],
    });
    Ok(page_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{self, SpreadsheetFormat};
    use crate::normalize::Normalizer;
    use crate::types::PyramidBar;

    fn records() -> Vec<CensusRecord> {
        vec![
            CensusRecord::new("Región X", "Comuna, con coma", "0-9", 10, 12, Some(30)),
            CensusRecord::new("Región Y", "B", "10-19", 3, 0, None),
        ]
    }

    fn charts() -> ChartData {
        ChartData {
            pyramid: vec![PyramidBar { age_group: "0-9".into(), male: 10, female: 12 }],
            by_region: vec![("Región X".into(), 22)],
            by_age: vec![("0-9".into(), 22)],
        }
    }

    #[test]
    fn csv_has_headers_and_quotes_commas() {
        let bytes = to_csv(&records()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("region,comuna,grupo_edad,hombres,mujeres,poblacion_censo,total"));
        assert_eq!(lines.next(), Some("Región X,\"Comuna, con coma\",0-9,10,12,30,22"));
        assert_eq!(lines.next(), Some("Región Y,B,10-19,3,0,,3"));
    }

    #[test]
    fn xlsx_reads_back_through_ingestion() {
        let bytes = to_xlsx(&records()).unwrap();
        let rows = data::read_rows(&bytes, SpreadsheetFormat::Workbook).unwrap();
        let (back, _) = Normalizer::default().normalize(&rows);
        assert_eq!(back, records());
    }

    #[test]
    fn pdf_has_one_page_per_chart() {
        let bytes = to_pdf(&charts(), &ChartKind::ALL, ChartOptions { width: 200, height: 150 }).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn tall_charts_keep_their_aspect_ratio() {
        assert_eq!(fit_to_page(800, 600), (A4_WIDTH, 446));
        let (w, h) = fit_to_page(400, 1600);
        assert_eq!(h, A4_HEIGHT);
        assert_eq!(w, 210);
        assert!(w * 1600 / 400 <= A4_HEIGHT + 4);

        let bytes = to_pdf(&charts(), &[ChartKind::Age], ChartOptions { width: 200, height: 900 }).unwrap();
        assert_eq!(Document::load_mem(&bytes).unwrap().get_pages().len(), 1);
    }

    #[test]
    fn pdf_without_charts_is_rejected() {
        assert!(to_pdf(&charts(), &[], ChartOptions::default()).is_err());
    }

    #[test]
    fn format_parsing() {
        assert_eq!("XLSX".parse::<ExportFormat>().unwrap(), ExportFormat::Xlsx);
        assert_eq!("pdf".parse::<ExportFormat>().unwrap().default_file_name(), "Datacensus_Reporte.pdf");
        assert!("docx".parse::<ExportFormat>().is_err());
    }
}
