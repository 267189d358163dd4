//! Troupe: multi-agent orchestration runtime.
//!
//! A tree of agents cooperatively produces a stream of [`events::Event`]s
//! while plugins observe and intercept every lifecycle point, and a
//! [`session::SessionService`] reconciles the resulting state deltas into
//! app, user and session scoped state.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use troupe::prelude::*;
//!
//! # async fn example(greeter: Arc<dyn Agent>, reviewer: Arc<dyn Agent>) -> troupe::error::Result<()> {
//! let pipeline: Arc<dyn Agent> = Arc::new(SequentialAgent::new("pipeline", vec![greeter, reviewer]));
//! let runner = InMemoryRunner::new("demo", pipeline)?
//!     .with_plugin(Arc::new(LoggingPlugin::default()))?;
//!
//! let mut events = runner.run_async("user-1", "session-1", Content::user("Hello"), None);
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     println!("{}: {}", event.author, event.text().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod events;
pub mod live;
pub mod models;
pub mod plugins;
pub mod prelude;
pub mod runner;
pub mod services;
pub mod session;
pub mod state;
pub mod tools;
pub mod types;
