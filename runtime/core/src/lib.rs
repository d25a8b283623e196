// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2020 Takashi Sakamoto
pub mod cmdline;
pub mod ctl_table;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod normalizer;
pub mod registry;
pub mod request;
pub mod router;
pub mod stream_bus;

use {clap::ValueEnum, glib::Error};

/// The level to debug runtime.
#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Debug
    }
}

pub trait RuntimeOperation<T>: Sized {
    fn new(arg: T, log_level: Option<LogLevel>) -> Result<Self, Error>;
    fn listen(&mut self) -> Result<(), Error>;
    fn run(&mut self) -> Result<(), Error>;
}
