//! Tandem is an orchestration engine that lets a locally hosted language
//! model call tools exposed by Model Context Protocol servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp::transport`] frames protocol messages over a server process's
//!   pipes or a streamable HTTP endpoint.
//! - [`mcp::session`] owns one transport, performs the handshake, and
//!   correlates concurrent requests with their responses.
//! - [`mcp::registry`] aggregates every server's tool catalog into one
//!   namespace with later-registration-wins shadowing.
//! - [`mcp::dispatcher`] validates model-issued tool calls against their
//!   schemas, enforces concurrency and retry policy, and routes each call
//!   to its owning session.
//! - [`core::conversation`] drives the turn loop: model output in, tool
//!   results folded back as transcript data, repeat until a final answer
//!   or the round limit.
//! - [`core::engine`] assembles the shared pool, with explicit startup and
//!   teardown, and hands out per-conversation transcripts.
//!
//! Hosts embed the engine behind [`core::engine::Engine`]: connect the
//! pool, implement [`core::provider::ChatProvider`] over the local model,
//! and run [`core::conversation::Conversation::submit_user_message`].

pub mod core;
pub mod logging;
pub mod mcp;
