// ===============================
// src/lib.rs
// ===============================
//
// Engine pieces, wired together by main.rs:
//   feed -> dispatcher -> state (validate) -> bus -> {UI, executor, recorder}
//
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod executor;
pub mod feed;
pub mod metrics;
pub mod recorder;
pub mod ring;
pub mod state;
pub mod strategy;
pub mod validate;
pub mod worker;
