//! Cross-primitive scenarios for lariat-tasks, exercised via the public API.
//!
//! The scenarios live in `tests/`.
