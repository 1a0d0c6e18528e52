/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! fieldcore – task runtime, TDF telemetry and RPC command core
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── time          – 48.16 epoch time helpers and the Clock trait
//! ├── errno         – errno values carried in RPC return codes
//! ├── tdf/          – TDF buffer encoder and parser
//! ├── data_logger/  – buffered TDF loggers over block backends
//! ├── task/         – schedule descriptors and the schedule evaluator
//! ├── runner/       – task runner, work queue and auto-iterate driver
//! ├── rpc/          – wire types, server, command runner, client
//! └── config/       – YAML runtime configuration
//! ```

pub mod config;
pub mod data_logger;
pub mod errno;
pub mod rpc;
pub mod runner;
pub mod task;
pub mod tdf;
pub mod time;
