// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth Server - Control-Plane Composition
//!
//! Everything that turns the domain layer into a running control plane:
//! the HTTP boundary, bearer-token verification, the deployment dispatcher,
//! service lifecycle workflows, the status reconciler, Redis-backed
//! coordination, and the SSE push streams. `berth-core` supplies the types
//! and contracts this crate wires together; `berth-runtime` supplies live
//! container truth.

/// Tenant ownership checks.
pub mod access;

/// HTTP boundary.
pub mod api;

/// Bearer-token verification.
pub mod auth;

/// Environment configuration.
pub mod config;

/// Service CRUD and runtime workflows.
pub mod control;

/// At-rest encryption for source-control credentials.
pub mod credentials;

/// Deployment creation and worker handoff.
pub mod dispatcher;

/// Background status correction.
pub mod reconciler;

/// Redis-backed lock, queue, and log pub/sub.
pub mod redis;

/// Long-lived push streams.
pub mod stream;
