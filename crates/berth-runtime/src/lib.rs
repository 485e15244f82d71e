// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth Runtime - Container Engine Gateway
//!
//! This crate is the control plane's view of the container engine: discovery
//! of live containers by label, lifecycle operations, metrics sampling, and
//! the restart/stop workflows built on them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     berth-server                          │
//! │        (dispatcher, status reads, reconciler)             │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                berth-runtime (This Crate)                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐   │
//! │  │ ContainerRun │  │  Provision   │  │ restart/stop  │   │
//! │  │ time trait   │  │ conventions  │  │  workflows    │   │
//! │  └──────┬───────┘  └──────────────┘  └───────────────┘   │
//! │         │                                                 │
//! │   ┌─────┴──────┐                                          │
//! │   ▼            ▼                                          │
//! │ DockerRuntime  MockRuntime                                │
//! └──────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//!   `docker` CLI ──► container engine socket
//! ```
//!
//! # Discovery by label, never by name
//!
//! Container names are regenerated on every restart. Every container a
//! standalone service owns carries `berth.service.id=<uuid>`; compose-style
//! stacks carry `com.docker.compose.project=<project>` instead. All
//! discovery matches those labels.
//!
//! # Workflows
//!
//! | Workflow | Behavior |
//! |----------|----------|
//! | [`ops::restart_service`] | Create and start a replacement, then best-effort stop/remove the old containers |
//! | [`ops::stop_service`] | Stop only containers currently running |
//!
//! The engine is the system of record for "is it really running". Gateways
//! never cache and never touch the database; persisting status changes is
//! the caller's job, under the status lock.
//!
//! # Modules
//!
//! - [`docker`]: Gateway shelling the `docker` CLI with JSON output
//! - [`mock`]: In-memory engine with failure injection, for tests and demos
//! - [`ops`]: Restart and stop workflows over the trait
//! - [`provision`]: Deterministic names, labels, limits, and routing rules

#![deny(missing_docs)]

/// Gateway shelling the `docker` CLI.
pub mod docker;

/// In-memory engine with failure injection.
pub mod mock;

/// Restart and stop workflows.
pub mod ops;

/// Deterministic provisioning conventions.
pub mod provision;

mod traits;

pub use mock::MockRuntime;
pub use traits::*;
