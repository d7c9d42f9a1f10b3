/*
 * 5D Labs Agent Platform - Task Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![warn(clippy::pedantic)]
// Documentation lints are relaxed crate-wide
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! Utilities run inside Task workload pods
//!
//! Each module backs one `task-tools` subcommand:
//! - `collect-outputs`: sidecar that harvests output parameters
//! - `context-init`: copies context files into the workspace
//! - `url-fetch`: downloads a URL context
//! - `git-init`: clones a Git context

pub mod context_init;
pub mod error;
pub mod git_init;
pub mod outputs;
pub mod url_fetch;

pub use error::{Result, ToolError};

/// Environment lookup, injectable so configuration parsing can be tested
pub trait Env {
    fn get(&self, key: &str) -> Option<String>;

    /// Non-empty value of `key`
    fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &'static str) -> Result<String> {
        self.non_empty(key).ok_or(ToolError::MissingEnv(key))
    }
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Env for std::collections::BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        std::collections::BTreeMap::get(self, key).cloned()
    }
}
