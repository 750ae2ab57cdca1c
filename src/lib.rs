// src/lib.rs

//! Equo Package Manager
//!
//! Binary package manager for atom-addressed packages served by several
//! prioritized repositories.
//!
//! # Architecture
//!
//! - Database-first: installed packages and the repository registry live in
//!   SQLite; every repository keeps its own package database
//! - Atoms: `[op]category/name[-version][:slot][#tag][~revision]` specifiers
//!   resolved across repositories by priority and version
//! - Resolution results are cached against database fingerprints
//! - Transactions: one package per transaction, executed as an ordered list
//!   of steps with triggers around the filesystem merge

pub mod atom;
pub mod cache;
pub mod config;
pub mod db;
mod error;
pub mod filesystem;
pub mod packages;
pub mod repository;
pub mod resolver;
pub mod transaction;
pub mod trigger;
pub mod version;

pub use error::{Error, Result};
