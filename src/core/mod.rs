//! Shared domain types: models, priority ordering, decay math, and the
//! token budgeter.

pub mod budgeter;
pub mod decay;
pub mod models;
pub mod priority;

pub use budgeter::{apply_budget, estimate_tokens, Section};
pub use models::{
    generate_event_id, quality_score, token_estimate, Chunk, Decision, Event, EventSource,
    GlobalSearchResult, PackFormat, PlanMeta, ProjectEntry, ProjectState, SearchResult,
    SessionMeta, StateTask, TaskItem, TaskStatus, TodoItem, TodoList, TodoStatus,
};
pub use priority::Priority;
