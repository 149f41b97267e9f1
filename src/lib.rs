//! # Basket
//!
//! Natural-language item ingestion for shared shopping lists.
//!
//! Basket turns a free-form fragment ("молоко 2л, хлеб, яблоки 1кг"), typed,
//! spoken, or read off a receipt, into canonical list items. A reasoning
//! model does the segmentation and normalization, steered by a product
//! catalog; the results are filtered by confidence, persisted as training
//! data, added to a list, and announced to the rest of the family.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ text / voice │──▶│   Ingestor   │──▶│   SQLite    │
//! │   receipt    │   │ prompt+model │   │ raw/parsed/ │
//! └──────────────┘   │ parse+filter │   │  mappings   │
//!                    └──────┬───────┘   └─────────────┘
//!                           │
//!              ┌────────────┼─────────────┐
//!              ▼            ▼             ▼
//!        ┌──────────┐ ┌───────────┐ ┌───────────┐
//!        │  lists   │ │  fanout   │ │ translate │
//!        │          │ │ (family)  │ │  (cache)  │
//!        └──────────┘ └───────────┘ └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! basket init
//! basket catalog import ./catalog.json
//! basket ingest "молоко 2л, хлеб" --user <uuid> --list <uuid> --lang ru
//! basket translate leche pan --to en
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error kinds per pipeline stage |
//! | [`scope`] | Cancellation and deadline propagation |
//! | [`prompt`] | Template-based prompt assembly |
//! | [`model`] | Reasoning-model client |
//! | [`parse`] | JSON recovery from model output |
//! | [`catalog`] | Product reference table |
//! | [`store`] | Training-data persistence |
//! | [`ingest`] | Ingestion pipeline |
//! | [`translate`] | Translation cache |
//! | [`lists`] | Shopping-list items |
//! | [`fanout`] | Family notifications |
//! | [`intake`] | Voice and receipt intake |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod intake;
pub mod lists;
pub mod migrate;
pub mod model;
pub mod models;
pub mod parse;
pub mod prompt;
pub mod scope;
pub mod store;
pub mod translate;
