//! Session orchestration core.
//!
//! ## Overview
//!
//! A session is one coding agent running in its own sandbox (a local
//! container or a cluster pod) against one branch of one repository. This
//! module creates sessions, tracks their lifecycle, fans their terminal out
//! to any number of clients, and drives the branch through commit, push,
//! pull request and merge.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP    ┌──────────────────────────────────────────────────┐
//! │  Client  │ ────────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (web/CLI)│ <──────── │    ├─ api.rs  (REST handlers, ApiError)          │
//! └──────────┘ WebSocket │    └─ ws.rs   (console + events sockets)         │
//!                        │         │                                        │
//!                        │         v                                        │
//!                        │  manager.rs  (SessionManager facade)             │
//!                        │    ├─ registry.rs ── db.rs      (state, SQLite)  │
//!                        │    │      └─ events.rs          (EventBus)       │
//!                        │    ├─ backend/   (BackendDriver: docker, k8s)    │
//!                        │    ├─ console.rs (StreamMultiplexer)             │
//!                        │    ├─ workflow.rs ── github.rs  (git, gh)        │
//!                        │    ├─ activity.rs (agent activity, idle sweep)   │
//!                        │    └─ poller.rs  (PR status polling)             │
//!                        └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Typical Flow
//!
//! 1. `POST /api/sessions` → `SessionManager::create_session()` records the
//!    session as `creating` and provisions in the background.
//! 2. The driver creates the sandbox (retrying transient failures), the
//!    workflow clones the repo and cuts the session branch, and the session
//!    becomes `running`.
//! 3. Clients attach over `/ws/console/{id}`; every status change arrives on
//!    `/ws/events`.
//! 4. `POST /api/sessions/{id}/publish` commits, pushes and opens a PR. The
//!    poller and the status webhook keep the PR's check status current.
//! 5. `POST /api/sessions/{id}/merge` merges a mergeable PR and completes
//!    the session.

pub mod activity;
pub mod api;
pub mod backend;
pub mod console;
pub mod db;
pub mod events;
pub mod github;
pub mod manager;
pub mod models;
pub mod poller;
pub mod registry;
pub mod server;
pub mod state;
pub mod workflow;
pub mod ws;
