// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Weft
//!
//! A serving fabric for large language model inference: weft accepts
//! generation requests, multiplexes them onto a pool of model-runtime
//! subprocesses over a framed JSON-RPC bridge, and streams tokens back
//! with latency and throughput guarantees.
//!
//! ## Architecture
//!
//! ```text
//! generate ──► CanaryRouter ──► GenerateBatcher ──► Transport ──► runtime
//!                                                      │
//!              GeneratorFactory ◄── StreamRegistry ◄───┘ (token events)
//!                     │
//!                  consumer
//! ```
//!
//! Four tightly coupled subsystems do the work:
//!
//! - **Runtime bridge & stream registry** ([`transport`], [`supervisor`],
//!   [`registry`]): owns the runtime subprocess, the length-prefixed RPC
//!   transport over its stdio, and every in-flight generation stream.
//! - **Continuous generate-batcher** ([`batcher`]): coalesces concurrent
//!   calls into priority-aware, adaptively sized micro-batches.
//! - **Artifact/model cache** ([`cache`], [`manager`]): two-tier LRU cache
//!   of model artifacts with warm-start semantics and strict size caps.
//! - **QoS & canary control plane** ([`qos`], [`canary`]): TDigest-based
//!   SLO evaluation with automated remediation, and deterministic traffic
//!   splitting with automatic rollback.
//!
//! [`engine::Engine`] wires them together; embedders that need finer
//! control can compose the pieces directly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use weft::engine::{Engine, EngineGenerateRequest};
//! use weft::generator::GenerateRequest;
//! use weft::manager::{LoadOptions, ModelDescriptor};
//! use futures::StreamExt;
//!
//! # async fn run() -> weft::errors::Result<()> {
//! let config = weft::config::WeftConfig::load_layered(
//!     "weft.yaml".as_ref(),
//!     Some("weft.prod.yaml".as_ref()),
//! )?;
//! let engine = Engine::new(config)?;
//! engine.start().await?;
//!
//! engine
//!     .load_model(LoadOptions::new(ModelDescriptor::new("llama-3.2-3b-instruct")))
//!     .await?;
//!
//! let mut stream = engine.generate(EngineGenerateRequest::new(
//!     GenerateRequest::new("llama-3.2-3b-instruct", "Hello"),
//! ))?;
//! while let Some(item) = stream.next().await {
//!     println!("{item:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod cache;
pub mod canary;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod generator;
pub mod health;
pub mod manager;
pub mod metrics_constants;
pub mod qos;
pub mod registry;
pub mod supervisor;
pub mod sync;
pub mod transport;

mod metrics;

pub use batcher::{GenerateBatcher, Priority};
pub use cache::ArtifactCache;
pub use canary::{CanaryRouter, RuntimeVersion};
pub use config::WeftConfig;
pub use engine::{Engine, EngineGenerateRequest};
pub use errors::{EngineError, ErrorCode, Result};
pub use events::OperatorEvent;
pub use generator::{GenerateRequest, GeneratorFactory};
pub use health::{HealthReport, HealthStatus};
pub use manager::{LoadOptions, ModelDescriptor, ModelHandle, ModelManager};
pub use qos::QosMonitor;
pub use registry::{GenerationItem, StreamRegistry};
pub use supervisor::{CircuitBreaker, RuntimeSupervisor};
