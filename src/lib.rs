//! Asynchronous image conversion service.
//!
//! The API process accepts an upload, records a conversion request and
//! publishes a work item; the worker process drains the queue, converts the
//! image and advances the request to `done` or `failed`. The two only share
//! the database rows and the queue.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
