// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tributary Core - Activity Ingestion Engine
//!
//! This crate orchestrates periodic and event-driven ingestion of activity
//! data from external platforms. It manages runs, streams, and webhook
//! deliveries as durable state machines, persisting everything to
//! PostgreSQL (or SQLite for embedded use) for crash resilience.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        External Platforms                            │
//! │                (GitHub, Discord, Slack, DEV, ...)                    │
//! └─────────────────────────────────────────────────────────────────────┘
//!              ▲ polls                               │ webhooks
//!              │                                     ▼
//! ┌──────────────────────┐              ┌───────────────────────────────┐
//! │   PlatformAdapter    │              │        Webhook Ingress        │
//! │ (per-platform logic) │              │  (store delivery + enqueue)   │
//! └──────────┬───────────┘              └───────────────┬───────────────┘
//!            │                                          │
//!            ▼                                          ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        tributary-core                                │
//! │                                                                      │
//! │  Tick Scheduler ──► Check Trigger ──► Run Executor ──► Stream        │
//! │       │                                                Executor      │
//! │       │ promotes delayed runs                             │          │
//! │       ▼                                                   ▼          │
//! │  Stuck Auditor     Retention Sweeper              Webhook Executor   │
//! └──────────────────────────────────┬──────────────────────────────────┘
//!                                    │
//!                                    ▼
//!                      ┌──────────────────────────┐
//!                      │   PostgreSQL / SQLite    │
//!                      │    (Durable Storage)     │
//!                      └──────────────────────────┘
//! ```
//!
//! # Run State Machine
//!
//! ```text
//!                 ┌─────────┐
//!        ┌────────│ PENDING │◄───────────┐
//!        │        └────┬────┘            │ promote
//!        │             │ execute         │ (scheduler tick)
//!        │             ▼                 │
//!        │       ┌────────────┐     ┌─────────┐
//!        │       │ PROCESSING │────►│ DELAYED │
//!        │       └─────┬──────┘ rate└─────────┘
//!        │             │        limit
//!        │    streams  │  settle
//!        │    settle   ▼
//!        │  ┌──────────────────────────────────────┐
//!        │  │ PROCESSED │ ERROR │ INTEGRATION-     │
//!        └─►│           │       │ DELETED          │
//!           └──────────────────────────────────────┘
//! ```
//!
//! A run settles when every one of its streams is terminal: all
//! `processed` (or zero streams) yields `PROCESSED`; any stream that
//! exhausted its retries yields `ERROR`. Streams move through
//! `pending -> processing -> processed | error`, with failed streams
//! retried on an exponential backoff until the retry budget runs out.
//!
//! # Delivery Semantics
//!
//! Queue delivery is at-least-once. Every executor is guarded by a
//! state check so duplicate deliveries are discarded, and every
//! single-row transition asserts its affected row count so a broken
//! precondition surfaces as a fatal error instead of double-processing.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRIBUTARY_DATABASE_URL` | Yes | - | Database connection string |
//! | `TRIBUTARY_TICK_INTERVAL_SECS` | No | `60` | Scheduler tick interval |
//! | `TRIBUTARY_MAX_RETRIES` | No | `5` | Per-stream retry budget |
//! | `TRIBUTARY_STUCK_THRESHOLD_HOURS` | No | `1` | Staleness cutoff for the auditor |
//! | `TRIBUTARY_RETENTION_DAYS` | No | `90` | Retention window for terminal rows |
//!
//! See [`config::Config`] for the full list.
//!
//! # Modules
//!
//! - [`adapter`]: The platform adapter seam and registry
//! - [`auditor`]: Stuck-state detection and repair
//! - [`checker`]: Turns due platforms into pending runs
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types and the persisted error detail format
//! - [`executor`]: Queue consumers for runs, streams, and webhooks
//! - [`migrations`]: Embedded database migrations
//! - [`persistence`]: Database operations for runs, streams, and webhooks
//! - [`queue`]: Queue message contracts and the in-process queue
//! - [`retention`]: Deletion of terminal rows past the retention window
//! - [`runtime`]: Embeddable runtime wiring all tasks together
//! - [`scheduler`]: The wall-clock tick loop

#![deny(missing_docs)]

pub mod adapter;
pub mod auditor;
pub mod checker;
pub mod config;
pub mod error;
pub mod executor;
pub mod migrations;
pub mod persistence;
pub mod queue;
pub mod retention;
pub mod runtime;
pub mod scheduler;
