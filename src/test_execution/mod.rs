//! The per-test execution subsystem: the `TestExecutionActor` FSM and its
//! five fixed children.

pub mod block_storage;
pub mod cucumber_execution;
pub mod fsm;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod vault;
