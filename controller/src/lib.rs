/*
 * 5D Labs App Controller - Kubernetes controller for kapp-deployed Apps
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! App controller core library
//!
//! This crate provides the `App` and `PackageRepository` resource types and the
//! reconciliation engine that fetches, templates and deploys them with kapp.

pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{App, AppSpec, AppStatus, PackageRepository, PackageRepositorySpec};
pub use tasks::config::ControllerConfig;
