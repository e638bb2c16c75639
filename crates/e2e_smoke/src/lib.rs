//! Integration-only crate; see `tests/smoke.rs`.
