// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool model: trait, closure-backed builder, schema preparation, and
//! built-in eager tools.

pub mod builtin;
mod registry;
pub mod schema;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{FunctionTool, FunctionToolBuilder, Tool, ToolCall, DEFAULT_EMOJI};
