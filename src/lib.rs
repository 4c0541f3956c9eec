//! Census dashboard back-end.
//!
//! Spreadsheets are read into loose rows ([`data`]), repaired into
//! [`types::CensusRecord`]s ([`normalize`]), aggregated ([`processing`]) and
//! narrowed by filters ([`filter`]). [`state::DashboardState`] ties these
//! together per viewer; [`server`] exposes it over HTTP.

pub mod assistant;
pub mod config;
pub mod data;
pub mod export;
pub mod filter;
pub mod normalize;
pub mod processing;
pub mod render;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod types;
