use crate::types::{CensusRecord, GroupKey, PyramidBar, SexRatio, SummaryStats};
use rayon::prelude::*;
use std::borrow::Borrow;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    FirstSeen,
    Sorted,
}

/// Totals over the given records, saturating at `u64::MAX`. Works on the full set (`&[CensusRecord]`)
/// or a filtered view (`&[&CensusRecord]`).
pub fn summarize<R>(records: &[R]) -> SummaryStats
where
    R: Borrow<CensusRecord> + Sync,
{
    let (total, male_total, female_total) = records
        .par_iter()
        .map(|r| {
            let r = r.borrow();
            (r.total_count(), r.male_count(), r.female_count())
        })
        .reduce(
            || (0, 0, 0),
            |a, b| (a.0.saturating_add(b.0), a.1.saturating_add(b.1), a.2.saturating_add(b.2)),
        );

    let sex_ratio = if female_total > 0 {
        SexRatio::Ratio(male_total as f64 / female_total as f64)
    } else {
        SexRatio::NotApplicable
    };

    SummaryStats { total, male_total, female_total, sex_ratio }
}

/// Sum of `total_count` per distinct key. Each key appears exactly once.
pub fn group_totals<R>(records: &[R], key: GroupKey, order: GroupOrder) -> Vec<(String, u64)>
where
    R: Borrow<CensusRecord>,
{
    let mut groups: Vec<(String, u64)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for r in records {
        let r = r.borrow();
        let k = key.of(r);
        match index.get(k) {
            Some(&i) => groups[i].1 = groups[i].1.saturating_add(r.total_count()),
            None => {
                index.insert(k, groups.len());
                groups.push((k.to_string(), r.total_count()));
            }
        }
    }

    if order == GroupOrder::Sorted {
        groups.sort_by(|a, b| a.0.cmp(&b.0));
    }
    groups
}

/// Distinct values of a column, duplicate-free.
pub fn distinct_values<R>(records: &[R], key: GroupKey, order: GroupOrder) -> Vec<String>
where
    R: Borrow<CensusRecord>,
{
    group_totals(records, key, order)
        .into_iter()
        .map(|(k, _)| k)
        .collect()
}

/// Male and female sums per age group, in first-seen age order.
pub fn population_pyramid<R>(records: &[R]) -> Vec<PyramidBar>
where
    R: Borrow<CensusRecord>,
{
    let mut bars: Vec<PyramidBar> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for r in records {
        let r = r.borrow();
        let i = *index.entry(r.age_group()).or_insert_with(|| {
            bars.push(PyramidBar {
                age_group: r.age_group().to_string(),
                male: 0,
                female: 0,
            });
            bars.len() - 1
        });
        bars[i].male = bars[i].male.saturating_add(r.male_count());
        bars[i].female = bars[i].female.saturating_add(r.female_count());
    }

    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(region: &str, age: &str, male: u64, female: u64) -> CensusRecord {
        CensusRecord::new(region, "C", age, male, female, None)
    }

    #[test]
    fn sums_saturate_instead_of_overflowing() {
        use crate::normalize::Normalizer;
        use crate::types::{CellValue, RawRow};

        let row: RawRow = [
            ("region".to_string(), CellValue::Text("Norte".into())),
            ("grupos_edad".to_string(), CellValue::Text("0-9".into())),
            ("hombres".to_string(), CellValue::Text(u64::MAX.to_string())),
            ("mujeres".to_string(), CellValue::Number(1e30)),
        ]
        .into_iter()
        .collect();
        let (records, _) = Normalizer::default().normalize(&[row.clone(), row]);

        let stats = summarize(&records);
        assert_eq!(stats.male_total, u64::MAX);
        assert_eq!(stats.female_total, u64::MAX);
        assert_eq!(stats.total, u64::MAX);
        assert_eq!(group_totals(&records, GroupKey::Region, GroupOrder::Sorted), vec![("Norte".to_string(), u64::MAX)]);
        let bars = population_pyramid(&records);
        assert_eq!((bars[0].male, bars[0].female), (u64::MAX, u64::MAX));
    }

    #[test]
    fn empty_input_is_all_zero_and_not_applicable() {
        let stats = summarize::<CensusRecord>(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.male_total, 0);
        assert_eq!(stats.female_total, 0);
        assert_eq!(stats.sex_ratio, SexRatio::NotApplicable);
    }

    #[test]
    fn zero_females_is_not_applicable() {
        let stats = summarize(&[rec("R", "0-9", 10, 0)]);
        assert_eq!(stats.male_total, 10);
        assert_eq!(stats.total, 10);
        assert_eq!(stats.sex_ratio, SexRatio::NotApplicable);
    }

    #[test]
    fn sums_and_ratio() {
        let records = vec![rec("R1", "0-9", 30, 20), rec("R2", "0-9", 10, 20)];
        let stats = summarize(&records);
        assert_eq!(stats.total, 80);
        assert_eq!(stats.male_total, 40);
        assert_eq!(stats.female_total, 40);
        assert_eq!(stats.sex_ratio, SexRatio::Ratio(1.0));

        let filtered: Vec<&CensusRecord> = records.iter().skip(1).collect();
        let stats = summarize(&filtered);
        assert_eq!(stats.total, 30);
        assert_eq!(stats.sex_ratio.to_string(), "0.50");
    }

    #[test]
    fn group_by_age_merges_duplicate_keys() {
        let records = vec![
            rec("R", "0-9", 100, 0),
            rec("R", "0-9", 20, 30),
            rec("R", "10-19", 10, 20),
        ];
        let groups = group_totals(&records, GroupKey::AgeGroup, GroupOrder::FirstSeen);
        assert_eq!(groups, vec![("0-9".to_string(), 150), ("10-19".to_string(), 30)]);
    }

    #[test]
    fn sorted_and_first_seen_orders() {
        let records = vec![rec("Sur", "a", 1, 0), rec("Norte", "a", 2, 0), rec("Sur", "a", 3, 0)];
        let first = group_totals(&records, GroupKey::Region, GroupOrder::FirstSeen);
        assert_eq!(first, vec![("Sur".to_string(), 4), ("Norte".to_string(), 2)]);
        let sorted = distinct_values(&records, GroupKey::Region, GroupOrder::Sorted);
        assert_eq!(sorted, vec!["Norte".to_string(), "Sur".to_string()]);
    }

    #[test]
    fn pyramid_splits_by_sex() {
        let records = vec![rec("R", "20-29", 5, 7), rec("R", "0-9", 1, 1), rec("R", "20-29", 5, 3)];
        let bars = population_pyramid(&records);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0], PyramidBar { age_group: "20-29".into(), male: 10, female: 10 });
        assert_eq!(bars[1].age_group, "0-9");
    }
}
