//! Shared test utilities for bookforge integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated test execution with an in-memory database
//!   and temporary artifact storage
//! - Scripted collaborators whose failure behavior tests control per case

pub mod harness;

pub use harness::{CollectingChannel, ScriptedImages, ScriptedText, TestHarness};
