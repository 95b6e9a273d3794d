//! Reconciliation entry point for survey question responses.
//!
//! [`SurveyEngine`] wires the pure planner from `survey-kernel-core` to the
//! SQLite store, and owns the per-contact locks, the response cache and the
//! answer-action registry.

mod actions;
mod cache;
mod config;
mod engine;
mod locks;
mod logging;
mod policy;

pub use actions::{
    ActionContext, ActionDispatchError, AnswerActionHandler, AnswerActionRegistry,
    LoggingActionHandler,
};
pub use cache::ResponseCache;
pub use config::EngineConfig;
pub use engine::{NextScript, SurveyEngine, SurveyEngineBuilder};
pub use logging::init_tracing;
pub use policy::{MarkRespondedPolicy, MessageStatusPolicy, RetainStatusPolicy, StatusFacts};
