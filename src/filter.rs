use crate::types::CensusRecord;
use serde::{Deserialize, Deserializer, Serialize};

/// A wildcard or an exact-match value. Deserializes from `null` or a blank
/// string as the wildcard and any other string as a value. Filter fields
/// also accept their dropdown's "any" label, see [`Selection::or_sentinel`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum Selection {
    #[default]
    All,
    Only(String),
}

impl Selection {
    pub fn only(value: impl Into<String>) -> Self {
        Selection::Only(value.into())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(v) => v == value,
        }
    }

    /// Like `From<Option<String>>`, but `sentinel` also means "any".
    pub fn or_sentinel(value: Option<String>, sentinel: &str) -> Self {
        match value {
            Some(v) if v.trim() == sentinel => Selection::All,
            other => Selection::from(other),
        }
    }
}

impl From<Option<String>> for Selection {
    fn from(value: Option<String>) -> Self {
        match value {
            None => Selection::All,
            Some(v) if v.trim().is_empty() => Selection::All,
            Some(v) => Selection::Only(v),
        }
    }
}

impl From<Selection> for Option<String> {
    fn from(value: Selection) -> Self {
        match value {
            Selection::All => None,
            Selection::Only(v) => Some(v),
        }
    }
}

/// Region and comuna dropdowns label their wildcard "Todas".
pub const ANY_PLACE: &str = "Todas";
/// The age group dropdown labels its wildcard "Todos".
pub const ANY_AGE_GROUP: &str = "Todos";

fn any_place<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Selection, D::Error> {
    Ok(Selection::or_sentinel(Option::deserialize(deserializer)?, ANY_PLACE))
}

fn any_age_group<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Selection, D::Error> {
    Ok(Selection::or_sentinel(Option::deserialize(deserializer)?, ANY_AGE_GROUP))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SexFilter {
    #[default]
    #[serde(alias = "all", alias = "Todos")]
    All,
    #[serde(alias = "male", alias = "H")]
    Male,
    #[serde(alias = "female", alias = "M")]
    Female,
}

impl SexFilter {
    /// Inclusive: a row carrying both sexes matches either filter.
    pub fn matches(&self, record: &CensusRecord) -> bool {
        match self {
            SexFilter::All => true,
            SexFilter::Male => record.male_count() > 0,
            SexFilter::Female => record.female_count() > 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeographicFilter {
    #[serde(default, deserialize_with = "any_place")]
    pub region: Selection,
    #[serde(default, deserialize_with = "any_place")]
    pub comuna: Selection,
}

impl GeographicFilter {
    pub fn matches(&self, record: &CensusRecord) -> bool {
        self.region.matches(record.region()) && self.comuna.matches(record.comuna())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemographicFilter {
    #[serde(default, deserialize_with = "any_age_group")]
    pub age_group: Selection,
    #[serde(default)]
    pub sex: SexFilter,
}

impl DemographicFilter {
    pub fn matches(&self, record: &CensusRecord) -> bool {
        self.age_group.matches(record.age_group()) && self.sex.matches(record)
    }
}

/// Transient query: either group may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterCriteria {
    pub geographic: Option<GeographicFilter>,
    pub demographic: Option<DemographicFilter>,
}

impl FilterCriteria {
    pub fn geographic(filter: GeographicFilter) -> Self {
        Self { geographic: Some(filter), demographic: None }
    }

    pub fn demographic(filter: DemographicFilter) -> Self {
        Self { geographic: None, demographic: Some(filter) }
    }

    pub fn is_empty(&self) -> bool {
        self.geographic.is_none() && self.demographic.is_none()
    }

    pub fn matches(&self, record: &CensusRecord) -> bool {
        self.geographic.as_ref().map_or(true, |g| g.matches(record))
            && self.demographic.as_ref().map_or(true, |d| d.matches(record))
    }
}

/// Records of `full` satisfying `criteria`, in their original order.
pub fn apply<'a>(full: &'a [CensusRecord], criteria: &FilterCriteria) -> Vec<&'a CensusRecord> {
    full.iter().filter(|r| criteria.matches(r)).collect()
}

/// Same as [`apply`] but returns positions in `full`.
pub fn apply_indices(full: &[CensusRecord], criteria: &FilterCriteria) -> Vec<usize> {
    full.iter()
        .enumerate()
        .filter(|(_, r)| criteria.matches(r))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(region: &str, comuna: &str, age: &str, male: u64, female: u64) -> CensusRecord {
        CensusRecord::new(region, comuna, age, male, female, None)
    }

    #[test]
    fn region_filter_keeps_relative_position() {
        let full = vec![
            rec("Región Y", "A", "0-9", 1, 1),
            rec("Región X", "B", "0-9", 2, 2),
        ];
        let criteria = FilterCriteria::geographic(GeographicFilter {
            region: Selection::only("Región X"),
            comuna: Selection::All,
        });
        let out = apply(&full, &criteria);
        assert_eq!(out.len(), 1);
        assert!(std::ptr::eq(out[0], &full[1]));
        assert_eq!(apply_indices(&full, &criteria), vec![1]);
    }

    #[test]
    fn sex_filter_is_inclusive() {
        let full = vec![rec("R", "C", "0-9", 5, 5), rec("R", "C", "0-9", 0, 3), rec("R", "C", "0-9", 4, 0)];
        let male = FilterCriteria::demographic(DemographicFilter {
            age_group: Selection::All,
            sex: SexFilter::Male,
        });
        let female = FilterCriteria::demographic(DemographicFilter {
            age_group: Selection::All,
            sex: SexFilter::Female,
        });
        assert_eq!(apply_indices(&full, &male), vec![0, 2]);
        assert_eq!(apply_indices(&full, &female), vec![0, 1]);
    }

    #[test]
    fn all_predicates_in_a_group_must_hold() {
        let full = vec![
            rec("R1", "C1", "0-9", 1, 0),
            rec("R1", "C2", "0-9", 1, 0),
            rec("R2", "C1", "0-9", 1, 0),
        ];
        let criteria = FilterCriteria::geographic(GeographicFilter {
            region: Selection::only("R1"),
            comuna: Selection::only("C1"),
        });
        assert_eq!(apply_indices(&full, &criteria), vec![0]);
    }

    #[test]
    fn empty_result_is_fine() {
        let full = vec![rec("R1", "C1", "0-9", 1, 0)];
        let criteria = FilterCriteria::demographic(DemographicFilter {
            age_group: Selection::only("80+"),
            sex: SexFilter::All,
        });
        assert!(apply(&full, &criteria).is_empty());
        assert!(apply(&[], &criteria).is_empty());
    }

    #[test]
    fn no_criteria_returns_everything() {
        let full = vec![rec("R1", "C1", "0-9", 0, 0), rec("R2", "C1", "0-9", 0, 0)];
        assert!(FilterCriteria::default().is_empty());
        assert_eq!(apply(&full, &FilterCriteria::default()).len(), 2);
    }

    #[test]
    fn wildcards_deserialize() {
        let f: GeographicFilter = serde_json::from_str(r#"{"region":"Todas","comuna":"Valdivia"}"#).unwrap();
        assert_eq!(f.region, Selection::All);
        assert_eq!(f.comuna, Selection::only("Valdivia"));

        let d: DemographicFilter = serde_json::from_str(r#"{"age_group":null,"sex":"H"}"#).unwrap();
        assert_eq!(d.age_group, Selection::All);
        assert_eq!(d.sex, SexFilter::Male);

        let d: DemographicFilter = serde_json::from_str("{}").unwrap();
        assert_eq!(d, DemographicFilter::default());
    }

    #[test]
    fn only_the_dropdown_label_is_a_wildcard() {
        let f: GeographicFilter = serde_json::from_str(r#"{"region":"all","comuna":"Todos"}"#).unwrap();
        assert_eq!(f.region, Selection::only("all"));
        assert_eq!(f.comuna, Selection::only("Todos"));

        let d: DemographicFilter = serde_json::from_str(r#"{"age_group":"Todas"}"#).unwrap();
        assert_eq!(d.age_group, Selection::only("Todas"));
        let d: DemographicFilter = serde_json::from_str(r#"{"age_group":"Todos"}"#).unwrap();
        assert_eq!(d.age_group, Selection::All);

        let full = vec![rec("all", "Todos", "0-9", 1, 0), rec("Los Ríos", "Valdivia", "0-9", 1, 0)];
        assert_eq!(apply_indices(&full, &FilterCriteria::geographic(f)), vec![0]);

        assert_eq!(Selection::from(Some("Todas".to_string())), Selection::only("Todas"));
        assert_eq!(Selection::from(Some("  ".to_string())), Selection::All);
    }
}
