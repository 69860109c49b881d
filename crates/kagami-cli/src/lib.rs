//! Operator tooling for the kagami PAM stack: run an authentication from a
//! terminal, inspect guards and enrolled identities, and diagnose the install.

pub mod auth;
pub mod cli;
pub mod commands;
pub mod doctor;
pub mod errors;
pub mod guards;
pub mod identities;
pub mod output;
