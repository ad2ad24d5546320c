pub mod consumer;
pub mod converter;
pub mod producer;
pub mod queue;
pub mod storage;
