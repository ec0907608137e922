// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Core ingest/segment/record/detect/export/discovery subsystems, plus
//! [`registry`], the glue that wires them into one running process.
//! Configuration-file loading and the HTTP/web surface stay external; the
//! binary crate (`main.rs`) is a thin caller of `registry` for local
//! smoke-testing.

pub mod codec;
pub mod config;
pub mod detection;
pub mod export;
pub mod hls;
mod mp4_reader;
pub mod mp4_writer;
pub mod onvif;
pub mod recording;
pub mod registry;
pub mod sink;
pub mod stream;
pub mod supervisor;
pub mod ts;
pub mod zone;
