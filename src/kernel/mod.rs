//! The aggregation-and-harvest pipeline.
//!
//! Instrumentation -> bus -> registry -> feature aggregate -> aggregator,
//! then on each timer fire: aggregator take -> transport -> scheduler result
//! handling -> (on failure) aggregator merge.
//!
//! # EXECUTION MODEL
//! Single-threaded and cooperative. Bus dispatch, aggregation and scheduler
//! transitions run to completion; the only suspension points are the harvest
//! timer and the transport completion, both owned by the reactor.

pub mod aggregator;
pub mod bus;
pub mod context;
pub mod event;
pub mod reactor;
pub mod registry;
pub mod scheduler;
pub mod time;
