//! Resilience helpers for backend round trips.

pub mod retry;
