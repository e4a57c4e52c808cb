//! nixpilot: validated, reversible changes to a declarative NixOS
//! configuration tree.
//!
//! A change request (a unified diff or an imperative command) passes the
//! safety policy, cheap validation and a build test before it touches the
//! live tree. Every transaction is bracketed by a snapshot and, once
//! activated, watched for health regressions and rolled back on failure.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod generator;
pub mod hash;
pub mod health;
pub mod logging;
pub mod patch;
pub mod policy;
pub mod request;
pub mod snapshot;
pub mod toolchain;
pub mod transaction;
pub mod ui;
pub mod validator;
