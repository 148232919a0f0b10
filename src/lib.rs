// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Asynchronous order fulfillment over AMQP.
//!
//! An order publisher emits one event per fulfillment concern onto a direct
//! exchange, payment and shipping workers consume their own queue, and everything
//! they give up on is dead-lettered through a fanout exchange into a single queue
//! drained by the dead-letter sink.

mod otel;

pub mod amqp;
pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod topology;
pub mod worker;
