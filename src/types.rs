use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

pub const UNSPECIFIED_REGION: &str = "Sin región";
pub const UNSPECIFIED_COMUNA: &str = "Sin comuna";
pub const UNSPECIFIED_AGE_GROUP: &str = "No especificado";

/// A spreadsheet cell as produced by ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
}

impl CellValue {
    /// Empty text counts as absent, the same as a missing column.
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => write!(f, "{}", s),
            CellValue::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            CellValue::Number(n) => write!(f, "{}", n),
        }
    }
}

// Column label -> cell. Absent cells are simply not present in the map.
pub type RawRow = HashMap<String, CellValue>;

/// One normalized census row. Fields are private so `total_count` can only be
/// derived at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CensusRecord {
    region: String,
    comuna: String,
    #[serde(rename = "grupo_edad")]
    age_group: String,
    #[serde(rename = "hombres")]
    male_count: u64,
    #[serde(rename = "mujeres")]
    female_count: u64,
    #[serde(rename = "poblacion_censo")]
    census_population: Option<u64>,
    #[serde(rename = "total")]
    total_count: u64,
}

impl CensusRecord {
    pub fn new(
        region: impl Into<String>,
        comuna: impl Into<String>,
        age_group: impl Into<String>,
        male_count: u64,
        female_count: u64,
        census_population: Option<u64>,
    ) -> Self {
        Self {
            region: region.into(),
            comuna: comuna.into(),
            age_group: age_group.into(),
            male_count,
            female_count,
            census_population,
            total_count: male_count.saturating_add(female_count),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn comuna(&self) -> &str {
        &self.comuna
    }

    pub fn age_group(&self) -> &str {
        &self.age_group
    }

    pub fn male_count(&self) -> u64 {
        self.male_count
    }

    pub fn female_count(&self) -> u64 {
        self.female_count
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn census_population(&self) -> Option<u64> {
        self.census_population
    }
}

/// Column used to group or enumerate records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Region,
    Comuna,
    AgeGroup,
}

impl GroupKey {
    pub fn of<'a>(&self, record: &'a CensusRecord) -> &'a str {
        match self {
            GroupKey::Region => record.region(),
            GroupKey::Comuna => record.comuna(),
            GroupKey::AgeGroup => record.age_group(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SexRatio {
    Ratio(f64),
    NotApplicable,
}

impl fmt::Display for SexRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SexRatio::Ratio(r) => write!(f, "{:.2}", r),
            SexRatio::NotApplicable => write!(f, "N/A"),
        }
    }
}

impl Serialize for SexRatio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SexRatio::Ratio(r) => serializer.serialize_f64(*r),
            SexRatio::NotApplicable => serializer.serialize_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total: u64,
    pub male_total: u64,
    pub female_total: u64,
    pub sex_ratio: SexRatio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidBar {
    pub age_group: String,
    pub male: u64,
    pub female: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_derived_from_components() {
        let r = CensusRecord::new("Región X", "Comuna A", "0-9", 12, 30, None);
        assert_eq!(r.total_count(), 42);
        assert_eq!(r.total_count(), r.male_count() + r.female_count());
    }

    #[test]
    fn ratio_display_and_json() {
        assert_eq!(SexRatio::Ratio(1.0 / 3.0).to_string(), "0.33");
        assert_eq!(SexRatio::NotApplicable.to_string(), "N/A");
        assert_eq!(serde_json::to_value(SexRatio::NotApplicable).unwrap(), "N/A");
        assert_eq!(serde_json::to_value(SexRatio::Ratio(1.5)).unwrap(), 1.5);
    }

    #[test]
    fn record_serializes_with_table_column_names() {
        let r = CensusRecord::new("R", "C", "10-19", 1, 2, Some(5));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["grupo_edad"], "10-19");
        assert_eq!(v["hombres"], 1);
        assert_eq!(v["mujeres"], 2);
        assert_eq!(v["poblacion_censo"], 5);
        assert_eq!(v["total"], 3);
    }

    #[test]
    fn blank_cells() {
        assert!(CellValue::Text("  ".into()).is_blank());
        assert!(!CellValue::Number(0.0).is_blank());
        assert_eq!(CellValue::Number(7.0).to_string(), "7");
    }
}
