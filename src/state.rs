//! Per-viewer dashboard state and the view-model rendered from it.
//!
//! The normalized dataset is shared read-only; a `DashboardState` only owns
//! which rows are active and which table page is showing.

use crate::config::FilterMode;
use crate::filter::{self, DemographicFilter, FilterCriteria, GeographicFilter};
use crate::processing::{self, GroupOrder};
use crate::types::{CensusRecord, GroupKey, PyramidBar, SummaryStats};
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_ROWS_PER_PAGE: usize = 15;

pub const TABLE_HEADERS: [&str; 7] = [
    "region",
    "comuna",
    "grupo_edad",
    "hombres",
    "mujeres",
    "poblacion_censo",
    "total",
];

#[derive(Debug, Clone)]
pub struct DashboardState {
    records: Arc<[CensusRecord]>,
    active: Vec<usize>,
    criteria: FilterCriteria,
    mode: FilterMode,
    rows_per_page: usize,
    page: usize,
}

impl DashboardState {
    pub fn new(records: Arc<[CensusRecord]>, rows_per_page: usize, mode: FilterMode) -> Self {
        let active = (0..records.len()).collect();
        Self {
            records,
            active,
            criteria: FilterCriteria::default(),
            mode,
            rows_per_page: rows_per_page.max(1),
            page: 1,
        }
    }

    pub fn records(&self) -> &[CensusRecord] {
        &self.records
    }

    pub fn dataset(&self) -> &Arc<[CensusRecord]> {
        &self.records
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn active(&self) -> Vec<&CensusRecord> {
        self.active.iter().map(|&i| &self.records[i]).collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn apply_geographic(&mut self, geo: GeographicFilter) {
        self.criteria = match self.mode {
            FilterMode::Replace => FilterCriteria::geographic(geo),
            FilterMode::Compose => FilterCriteria {
                geographic: Some(geo),
                demographic: self.criteria.demographic.take(),
            },
        };
        self.refilter();
    }

    pub fn apply_demographic(&mut self, demo: DemographicFilter) {
        self.criteria = match self.mode {
            FilterMode::Replace => FilterCriteria::demographic(demo),
            FilterMode::Compose => FilterCriteria {
                geographic: self.criteria.geographic.take(),
                demographic: Some(demo),
            },
        };
        self.refilter();
    }

    /// Back to the full set, first page.
    pub fn reset(&mut self) {
        self.criteria = FilterCriteria::default();
        self.refilter();
    }

    pub fn reload(&mut self, records: Arc<[CensusRecord]>) {
        self.records = records;
        self.reset();
    }

    fn refilter(&mut self) {
        self.active = filter::apply_indices(self.records(), &self.criteria);
        self.page = 1;
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn total_pages(&self) -> usize {
        self.active.len().div_ceil(self.rows_per_page)
    }

    pub fn next_page(&mut self) -> usize {
        if self.page < self.total_pages() {
            self.page += 1;
        }
        self.page
    }

    pub fn prev_page(&mut self) -> usize {
        if self.page > 1 {
            self.page -= 1;
        }
        self.page
    }

    pub fn go_to_page(&mut self, page: usize) -> usize {
        self.page = page.clamp(1, self.total_pages().max(1));
        self.page
    }

    pub fn table_page(&self) -> TablePage {
        let start = (self.page - 1) * self.rows_per_page;
        let rows = self
            .active
            .iter()
            .skip(start)
            .take(self.rows_per_page)
            .map(|&i| self.records[i].clone())
            .collect();
        TablePage {
            headers: TABLE_HEADERS.to_vec(),
            rows,
            page: self.page,
            total_pages: self.total_pages(),
            total_rows: self.active.len(),
        }
    }

    pub fn summary(&self) -> SummaryStats {
        processing::summarize(&self.active())
    }

    pub fn charts(&self) -> ChartData {
        let active = self.active();
        ChartData {
            pyramid: processing::population_pyramid(&active),
            by_region: processing::group_totals(&active, GroupKey::Region, GroupOrder::FirstSeen),
            by_age: processing::group_totals(&active, GroupKey::AgeGroup, GroupOrder::FirstSeen),
        }
    }

    /// Option lists come from the full set so a filter never hides its own choices.
    pub fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            regions: processing::distinct_values(self.records(), GroupKey::Region, GroupOrder::Sorted),
            comunas: processing::distinct_values(self.records(), GroupKey::Comuna, GroupOrder::Sorted),
            age_groups: processing::distinct_values(self.records(), GroupKey::AgeGroup, GroupOrder::FirstSeen),
        }
    }

    pub fn view(&self) -> DashboardView {
        DashboardView {
            summary: self.summary(),
            charts: self.charts(),
            table: self.table_page(),
            filters: self.filter_options(),
            criteria: self.criteria.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub headers: Vec<&'static str>,
    pub rows: Vec<CensusRecord>,
    pub page: usize,
    pub total_pages: usize,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartData {
    pub pyramid: Vec<PyramidBar>,
    pub by_region: Vec<(String, u64)>,
    pub by_age: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterOptions {
    pub regions: Vec<String>,
    pub comunas: Vec<String>,
    pub age_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub summary: SummaryStats,
    pub charts: ChartData,
    pub table: TablePage,
    pub filters: FilterOptions,
    pub criteria: FilterCriteria,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Selection, SexFilter};
    use crate::types::SexRatio;

    fn dataset(n: usize) -> Arc<[CensusRecord]> {
        (0..n)
            .map(|i| {
                let region = if i % 2 == 0 { "Norte" } else { "Sur" };
                CensusRecord::new(region, format!("C{}", i % 3), format!("{}-{}", i * 10, i * 10 + 9), i as u64, 1, None)
            })
            .collect()
    }

    fn north() -> GeographicFilter {
        GeographicFilter { region: Selection::only("Norte"), comuna: Selection::All }
    }

    fn only_male() -> DemographicFilter {
        DemographicFilter { age_group: Selection::All, sex: SexFilter::Male }
    }

    #[test]
    fn pagination_over_full_set() {
        let mut state = DashboardState::new(dataset(40), DEFAULT_ROWS_PER_PAGE, FilterMode::Replace);
        assert_eq!(state.total_pages(), 3);
        assert_eq!(state.table_page().rows.len(), 15);
        assert_eq!(state.next_page(), 2);
        assert_eq!(state.next_page(), 3);
        assert_eq!(state.next_page(), 3);
        assert_eq!(state.table_page().rows.len(), 10);
        assert_eq!(state.prev_page(), 2);
        assert_eq!(state.go_to_page(99), 3);
        assert_eq!(state.go_to_page(0), 1);
        assert_eq!(state.prev_page(), 1);
    }

    #[test]
    fn filters_replace_each_other_by_default() {
        let mut state = DashboardState::new(dataset(10), 5, FilterMode::Replace);
        state.apply_geographic(north());
        assert_eq!(state.active_len(), 5);
        state.apply_demographic(only_male());
        // Geographic filter is gone: row 0 has zero males, the other 9 remain.
        assert!(state.criteria().geographic.is_none());
        assert_eq!(state.active_len(), 9);
    }

    #[test]
    fn compose_mode_stacks_groups() {
        let mut state = DashboardState::new(dataset(10), 5, FilterMode::Compose);
        state.apply_geographic(north());
        state.apply_demographic(only_male());
        assert!(state.criteria().geographic.is_some());
        assert_eq!(state.active_len(), 4);
    }

    #[test]
    fn filtering_resets_page_and_reset_restores_all() {
        let mut state = DashboardState::new(dataset(40), 15, FilterMode::Replace);
        state.next_page();
        state.apply_geographic(north());
        assert_eq!(state.page(), 1);
        assert_eq!(state.active_len(), 20);
        state.reset();
        assert_eq!(state.active_len(), 40);
        assert!(state.criteria().is_empty());
    }

    #[test]
    fn empty_subset_propagates() {
        let mut state = DashboardState::new(dataset(4), 15, FilterMode::Replace);
        state.apply_geographic(GeographicFilter { region: Selection::only("Nada"), comuna: Selection::All });
        let view = state.view();
        assert_eq!(view.summary.total, 0);
        assert_eq!(view.summary.sex_ratio, SexRatio::NotApplicable);
        assert!(view.table.rows.is_empty());
        assert_eq!(view.table.total_pages, 0);
        assert!(view.charts.by_region.is_empty());
        assert_eq!(view.filters.regions, vec!["Norte".to_string(), "Sur".to_string()]);
    }

    #[test]
    fn reload_swaps_dataset() {
        let mut state = DashboardState::new(dataset(4), 15, FilterMode::Replace);
        state.apply_geographic(north());
        state.reload(dataset(7));
        assert_eq!(state.active_len(), 7);
        assert_eq!(state.records().len(), 7);
    }

    #[test]
    fn view_reflects_active_subset() {
        let mut state = DashboardState::new(dataset(4), 15, FilterMode::Replace);
        state.apply_geographic(north());
        let view = state.view();
        // rows 0 and 2: males 0 + 2, females 1 + 1
        assert_eq!(view.summary.male_total, 2);
        assert_eq!(view.summary.female_total, 2);
        assert_eq!(view.charts.by_region, vec![("Norte".to_string(), 4)]);
        assert_eq!(view.table.headers, TABLE_HEADERS.to_vec());
    }
}
