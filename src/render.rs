use crate::state::ChartData;
use anyhow::{Result, anyhow};
use image::{ImageFormat, RgbImage};
use plotters::prelude::*;
use plotters::style::register_font;
use serde::Deserialize;
use std::f64::consts::PI;
use std::io::Cursor;
use std::sync::OnceLock;

static FONT_BYTES: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");
static FONT_REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

const MALE_COLOR: &str = "#0ea5e9";
const FEMALE_COLOR: &str = "#d81b60";
const AGE_LINE_COLOR: &str = "#1a2b6d";
const REGION_PALETTE: [&str; 6] = ["#1a2b6d", "#0ea5e9", "#d81b60", "#22c55e", "#f59e0b", "#9333ea"];
const LEGEND_ROW_HEIGHT: u32 = 24;
const LEGEND_COLUMN_WIDTH: u32 = 200;
const LEGEND_LABEL_CHARS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    /// Male/female bars per age group.
    Pyramid,
    /// Share of total population per region.
    Region,
    /// Total population per age group.
    Age,
}

impl ChartKind {
    pub const ALL: [ChartKind; 3] = [ChartKind::Pyramid, ChartKind::Region, ChartKind::Age];

    pub fn title(&self) -> &'static str {
        match self {
            ChartKind::Pyramid => "Pirámide poblacional",
            ChartKind::Region => "Distribución por región",
            ChartKind::Age => "Población total por grupo de edad",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChartOptions {
    pub width: u32,
    pub height: u32,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self { width: 800, height: 600 }
    }
}

/// A chart as raw RGB pixels, row-major, 3 bytes per pixel.
pub struct RenderedChart {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl RenderedChart {
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let img = RgbImage::from_raw(self.width, self.height, self.rgb.clone())
            .ok_or_else(|| anyhow!("Chart buffer does not match {}x{}", self.width, self.height))?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

// Every text element uses the "sans-serif" family; the font ships with the crate.
fn ensure_font() -> Result<()> {
    FONT_REGISTERED
        .get_or_init(|| {
            register_font("sans-serif", FontStyle::Normal, FONT_BYTES)
                .map_err(|_| "bundled chart font is not a valid TrueType file".to_string())
        })
        .clone()
        .map_err(|e| anyhow!(e))
}

pub fn render_chart(kind: ChartKind, data: &ChartData, options: ChartOptions) -> Result<RenderedChart> {
    ensure_font()?;
    let (w, h) = (options.width.max(64), options.height.max(64));
    let mut rgb = vec![0u8; (w * h * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut rgb, (w, h)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;
        match kind {
            ChartKind::Pyramid => draw_pyramid(&root, data)?,
            ChartKind::Region => draw_region_pie(&root, data)?,
            ChartKind::Age => draw_age_line(&root, data)?,
        }
        root.present().map_err(draw_err)?;
    }
    Ok(RenderedChart { width: w, height: h, rgb })
}

pub fn render_png(kind: ChartKind, data: &ChartData, options: ChartOptions) -> Result<Vec<u8>> {
    render_chart(kind, data, options)?.to_png()
}

type Area<'a> = DrawingArea<BitMapBackend<'a>, plotters::coord::Shift>;

fn draw_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("Chart drawing failed: {}", e)
}

// Headroom so the tallest bar does not touch the frame.
fn y_max(max: u64) -> u64 {
    max.saturating_add(max / 10).max(1)
}

fn draw_pyramid(root: &Area, data: &ChartData) -> Result<()> {
    let labels: Vec<&str> = data.pyramid.iter().map(|b| b.age_group.as_str()).collect();
    let max = data.pyramid.iter().map(|b| b.male.max(b.female)).max().unwrap_or(0);
    let n = labels.len().max(1) as f64;

    let mut chart = ChartBuilder::on(root)
        .caption(ChartKind::Pyramid.title(), ("sans-serif", 24).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0f64..n, 0u64..y_max(max))
        .map_err(draw_err)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(labels.len().max(1))
        .x_label_formatter(&|x| label_at(&labels, *x))
        .x_desc("Grupo de edad")
        .y_desc("Población")
        .draw()
        .map_err(draw_err)?;

    let male = hex_to_rgb(MALE_COLOR);
    let female = hex_to_rgb(FEMALE_COLOR);
    chart
        .draw_series(data.pyramid.iter().enumerate().map(|(i, b)| {
            let x = i as f64;
            Rectangle::new([(x + 0.1, 0), (x + 0.5, b.male)], male.filled())
        }))
        .map_err(draw_err)?;
    chart
        .draw_series(data.pyramid.iter().enumerate().map(|(i, b)| {
            let x = i as f64;
            Rectangle::new([(x + 0.5, 0), (x + 0.9, b.female)], female.filled())
        }))
        .map_err(draw_err)?;

    Ok(())
}

fn draw_age_line(root: &Area, data: &ChartData) -> Result<()> {
    let labels: Vec<&str> = data.by_age.iter().map(|(k, _)| k.as_str()).collect();
    let max = data.by_age.iter().map(|(_, v)| *v).max().unwrap_or(0);
    let n = labels.len().max(1) as f64;

    let mut chart = ChartBuilder::on(root)
        .caption(ChartKind::Age.title(), ("sans-serif", 24).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0f64..n, 0u64..y_max(max))
        .map_err(draw_err)?;

    chart
        .configure_mesh()
        .x_labels(labels.len().max(1))
        .x_label_formatter(&|x| label_at(&labels, *x))
        .x_desc("Grupo de edad")
        .y_desc("Población total")
        .draw()
        .map_err(draw_err)?;

    let line = hex_to_rgb(AGE_LINE_COLOR);
    let points: Vec<(f64, u64)> = data
        .by_age
        .iter()
        .enumerate()
        .map(|(i, (_, v))| (i as f64 + 0.5, *v))
        .collect();

    chart
        .draw_series(AreaSeries::new(points.iter().copied(), 0, line.mix(0.2)).border_style(line))
        .map_err(draw_err)?;
    chart
        .draw_series(LineSeries::new(points, line.stroke_width(2)))
        .map_err(draw_err)?;

    Ok(())
}

fn draw_region_pie(root: &Area, data: &ChartData) -> Result<()> {
    let area = root
        .titled(ChartKind::Region.title(), ("sans-serif", 24).into_font())
        .map_err(draw_err)?;
    let (w, h) = area.dim_in_pixel();

    let per_row = (w / LEGEND_COLUMN_WIDTH).max(1) as usize;
    let legend_rows = data.by_region.len().div_ceil(per_row) as u32;
    let legend_h = (legend_rows * LEGEND_ROW_HEIGHT).min(h / 2);
    let (pie_area, legend_area) = area.split_vertically(h - legend_h);

    let (pw, ph) = pie_area.dim_in_pixel();
    let center = (pw as i32 / 2, ph as i32 / 2);
    let radius = (pw.min(ph) as f64 / 2.0) * 0.85;

    let total: u64 = data.by_region.iter().fold(0u64, |acc, (_, v)| acc.saturating_add(*v));
    if total == 0 {
        pie_area
            .draw(&Circle::new(center, radius as i32, hex_to_rgb(AGE_LINE_COLOR).stroke_width(1)))
            .map_err(draw_err)?;
    } else {
        let mut start = -PI / 2.0;
        for (i, (_, value)) in data.by_region.iter().enumerate() {
            let sweep = 2.0 * PI * (*value as f64 / total as f64);
            if sweep <= 0.0 {
                continue;
            }
            let points = slice_points(center, radius, start, sweep);
            pie_area.draw(&Polygon::new(points, region_color(i).filled())).map_err(draw_err)?;
            start += sweep;
        }
    }

    draw_legend(&legend_area, &data.by_region, per_row)
}

// Swatch and region name per slice, laid out in rows under the pie.
fn draw_legend(area: &Area, entries: &[(String, u64)], per_row: usize) -> Result<()> {
    for (i, (name, _)) in entries.iter().enumerate() {
        let x = (i % per_row) as i32 * LEGEND_COLUMN_WIDTH as i32 + 10;
        let y = (i / per_row) as i32 * LEGEND_ROW_HEIGHT as i32 + 4;
        area.draw(&Rectangle::new([(x, y), (x + 14, y + 14)], region_color(i).filled()))
            .map_err(draw_err)?;
        let label: String = name.chars().take(LEGEND_LABEL_CHARS).collect();
        area.draw(&Text::new(label, (x + 20, y), ("sans-serif", 14).into_font()))
            .map_err(draw_err)?;
    }
    Ok(())
}

fn region_color(i: usize) -> RGBColor {
    hex_to_rgb(REGION_PALETTE[i % REGION_PALETTE.len()])
}

fn slice_points(center: (i32, i32), radius: f64, start: f64, sweep: f64) -> Vec<(i32, i32)> {
    let steps = ((sweep / (2.0 * PI)) * 180.0).ceil().max(2.0) as usize;
    let mut points = Vec::with_capacity(steps + 2);
    points.push(center);
    for s in 0..=steps {
        let angle = start + sweep * (s as f64 / steps as f64);
        points.push((
            center.0 + (radius * angle.cos()).round() as i32,
            center.1 + (radius * angle.sin()).round() as i32,
        ));
    }
    points
}

fn label_at(labels: &[&str], x: f64) -> String {
    if x < 0.0 {
        return String::new();
    }
    labels.get(x.floor() as usize).map(|s| s.to_string()).unwrap_or_default()
}

fn hex_to_rgb(hex: &str) -> RGBColor {
    let hex = hex.trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range).and_then(|s| u8::from_str_radix(s, 16).ok()).unwrap_or(0)
    };
    RGBColor(channel(0..2), channel(2..4), channel(4..6))
}
