//! Watch engine tests against a real inotify channel.

mod engine_test;
