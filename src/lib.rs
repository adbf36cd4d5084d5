//! dbpilot: a natural-language bridge to SQL and document databases.
//!
//! An OpenAI-compatible model drives a fixed catalog of database tools over
//! a capability-declaring adapter (PostgreSQL, MySQL, SQLite or MongoDB).
//! The [`session`] module ties the pieces together; the binary wraps it in a
//! chat REPL.

pub mod adapters;
pub mod error;
pub mod llm;
pub mod security;
pub mod session;
pub mod tools;
