//! Process-level tests for moult live under `tests/`.
