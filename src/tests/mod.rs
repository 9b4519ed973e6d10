//! Cross-module tests and the test doubles shared with module tests.


mod pipeline_tests;
