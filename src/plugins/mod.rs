//! Illustrative plugin samples (§4.10): `echo` and `help` exercise the
//! `Plugin` contract end-to-end but carry no scope of their own beyond
//! demonstrating it.

pub mod echo;
pub mod help;

use crate::plugin::{register, PluginSpec};

/// Register every bundled sample plugin. Called once from the entry point
/// before the plugin manager's first refresh (§9: Rust has no load-time
/// init hook, so registration is an explicit phase instead).
pub fn register_all() {
    register(PluginSpec {
        name: "echo",
        help: "Echoes text back. Usage: echo <text...> [-shout]",
        commands: vec![echo::schema()],
        start: echo::start,
    });
    register(PluginSpec {
        name: "help",
        help: "Lists registered commands, or shows one command's usage.",
        commands: vec![help::schema()],
        start: help::start,
    });
}
