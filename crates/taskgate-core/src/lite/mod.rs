//! Lite-mode implementations of `taskgate-core` interfaces.
//!
//! This module provides an HS256 token authority for local development and tests, an in-process
//! mutex, a Postgres advisory-lock mutex, and in-memory and Postgres transaction marker stores.

pub mod jwt;
pub mod markers;
pub mod mutex;
pub mod pgmutex;
