//! Property-based tests for the structural codec, hash and diff

mod structural;
