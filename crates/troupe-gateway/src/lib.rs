//! HTTP gateway for the Troupe control plane.
//!
//! A thin axum layer over [`troupe_dispatch`]: `POST /chat` runs a
//! conversation to completion, `GET /chat/stream` mirrors dispatch events
//! over SSE, `GET /status` exposes breaker, retry, routing and cost
//! snapshots, and `GET /health` answers liveness probes. Rate limiting
//! from [`troupe_gate`] is applied in front of the chat routes.
//!
//! # Main types
//!
//! - [`AppState`] — the shared singletons, initialized once at startup
//! - [`build_router`] — assembles the axum router with middleware

pub mod server;

pub use server::{build_gate, build_router, AppState, ChatRequest, ChatResponse};
