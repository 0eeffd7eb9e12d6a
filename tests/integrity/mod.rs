//! Baseline store and gate tests against an on-disk database.

mod baseline_test;
