// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth Core - Deployment Control Plane Domain
//!
//! This crate holds the domain layer of the berth control plane: the data
//! model, the status lock contract, the status resolver, the build-job
//! contract, and the repository traits with their PostgreSQL and in-memory
//! backends. It has no HTTP, Redis, or container-engine code; those live
//! in `berth-server` and `berth-runtime` and are wired in at the
//! composition root.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          berth-server                               │
//! │        (HTTP API, SSE streams, dispatcher, reconciler)              │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                      │                       │
//!          │ repositories         │ StatusLock            │ JobQueue
//!          ▼                      ▼                       ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       berth-core (this crate)                       │
//! │     model · status resolver · lock contract · job contract          │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                                              │
//!          ▼                                              ▼
//! ┌───────────────────────┐                  ┌─────────────────────────┐
//! │      PostgreSQL       │                  │  berth-runtime          │
//! │ (services/deployments)│                  │  (live container truth) │
//! └───────────────────────┘                  └─────────────────────────┘
//! ```
//!
//! # Why a distributed status lock
//!
//! Two independent processes write `Service.status`: the API (deploy,
//! restart, stop requests) and the external build worker (progress
//! reports). Without serialization, a worker's `RUNNING` write can race a
//! stale API write and stick the service in a state that matches neither
//! source of truth. Every status mutation therefore runs inside
//! [`lock::with_status_lock`], which acquires a TTL-bounded lock named by
//! the service id, retries briefly under contention, and releases on all
//! exit paths.
//!
//! # Status resolution
//!
//! [`status::resolve`] reconciles three independently-lagging sources into
//! one authoritative status. Precedence, first match wins:
//!
//! | # | Condition | Result |
//! |---|-----------|--------|
//! | 1 | Persisted status is `DEPLOYING` | `DEPLOYING` |
//! | 2 | Latest deployment is `QUEUED`/`BUILDING` | `DEPLOYING` |
//! | 3 | Any matched live container `running` | `RUNNING` |
//! | 4 | Any matched live container `restarting` | `CRASHING` |
//! | 5 | All matched containers terminal | `STOPPED` |
//! | 6 | A matched container in an unknown state | that state, uppercased |
//! | 7 | No containers, latest deployment `FAILED` | `FAILED` |
//! | 8 | No containers, latest deployment `SUCCESS` | `STOPPED` |
//! | 9 | No deployments ever | `IDLE` |
//!
//! # Deployment status state machine
//!
//! ```text
//!      ┌────────┐   worker    ┌──────────┐
//!      │ QUEUED │────────────▶│ BUILDING │
//!      └────────┘             └────┬─────┘
//!                                  │
//!                        ┌─────────┴─────────┐
//!                        ▼                   ▼
//!                  ┌─────────┐          ┌────────┐
//!                  │ SUCCESS │          │ FAILED │
//!                  └─────────┘          └────────┘
//! ```
//!
//! The deployment row has a single writer (the worker) after creation, so
//! its updates are not lock-guarded; only the `Service.status` consequence
//! of a terminal report goes through the lock.
//!
//! # Ownership policy
//!
//! Ownership mismatches on services and deployments surface as
//! [`error::CoreError::NotFound`], never `Forbidden`, so a probing tenant
//! cannot learn whether another tenant's resource exists.
//!
//! # Modules
//!
//! - [`error`]: Error taxonomy with stable error codes
//! - [`job`]: Build-job payload and queue contract
//! - [`lock`]: Distributed status lock contract and retry helper
//! - [`migrations`]: Embedded PostgreSQL migrations
//! - [`model`]: Services, deployments, users, live container observations
//! - [`persistence`]: Repository traits, PostgreSQL and in-memory backends
//! - [`status`]: Pure status resolution

#![deny(missing_docs)]

/// Error taxonomy with stable error codes.
pub mod error;

/// Build-job payload and queue contract.
pub mod job;

/// Distributed status lock contract and retry helper.
pub mod lock;

/// Embedded PostgreSQL migrations.
pub mod migrations;

/// Domain records and closed status enums.
pub mod model;

/// Repository traits and backends.
pub mod persistence;

/// Pure status resolution.
pub mod status;

pub use error::{CoreError, Result};
