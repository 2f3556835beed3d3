//! Core modules of the artefact governance engine.
//!
//! Leaf-first: knowledge objects and route plans, the formatter, the
//! execute ledger, the marker state machine, contracts, and the review
//! conference engine on top of the anchor registry.

pub mod artefact;
pub mod broker;
pub mod conference;
pub mod config;
pub mod contract;
pub mod db;
pub mod error;
pub mod formatter;
pub mod knowledge;
pub mod ledger;
pub mod marker;
pub mod output;
pub mod registry;
pub mod route;
pub mod schemas;
pub mod store;
pub mod time;
