//! Cross-module scenario tests (spec.md §8): exercise the stdout-to-stats-to-
//! histogram-to-comparator pipeline end to end, the way
//! `cisco_lab::test::traffic_capture` drives its parser against whole
//! recorded sessions rather than single lines.

mod pipeline;
