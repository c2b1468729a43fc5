//! Integration tests for the arsock workspace live under `tests/`.
