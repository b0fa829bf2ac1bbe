//! Property-based tests for capture invariants
