//! # Switchyard
//!
//! `switchyard` is an in-process message router built with Rust. It keeps
//! the exchange and queue model of a classic message broker: publishers
//! send to exchanges, exchanges route over bindings, and consumers take
//! from FIFO queues, acknowledging deliveries when they want at-least-once
//! handling.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: The routing core that manages exchanges, queues, bindings and message dispatch.
//! - `config`: Handles loading and managing broker configuration.
//! - `dispatcher`: Runs registered consumer handlers against queues on worker tasks.
//! - `persistence`: Provides a mechanism for storing durable topology and messages (backed by `sled`).
//! - `utils`: Contains shared utilities, such as error handling and the logging setup.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod persistence;
pub mod utils;

pub use utils::BrokerError;
