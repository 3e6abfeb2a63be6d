//! # KB Indexer
//!
//! Indexing pipeline for per-workspace knowledge bases: turns changed
//! documents into chunked, embedded vector points and keeps exactly one
//! generation (revision) of each document current in the vector store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────────────────────┐   ┌──────────┐
//! │ enqueue  │──▶│  SQLite  │──▶│ Worker                       │──▶│  Qdrant  │
//! │ (kbx/API)│   │ job queue│   │ lock ▸ revision ▸ chunk ▸    │   │          │
//! └──────────┘   └──────────┘   │ embed ▸ upsert ▸ switch ▸    │   └──────────┘
//!                               │ cleanup ▸ action progress    │
//!                               └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbx init
//! kbx doc put acme handbook intro ./intro.md
//! kbx worker --once
//! kbx revision show acme intro
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and status enums |
//! | [`error`] | Error taxonomy and job failure classification |
//! | [`queue`] | Durable job queue |
//! | [`lock`] | Per-document database lock |
//! | [`revision`] | Revision lifecycle and atomic switchover |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding client |
//! | [`vector_store`] | Vector store gateway |
//! | [`pipeline`] | Per-job orchestration |
//! | [`worker`] | Poll loop |
//! | [`action`] | Run-level progress |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod action;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod lock;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod payload;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod revision;
pub mod sweep;
pub mod token;
pub mod ttl_store;
pub mod vector_store;
pub mod worker;
