/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Concurrent package downloads with mirror fallback, and mirror ranking
//! for Debian, Ubuntu and Devuan.

pub mod config;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod progress;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{DebboostError, DebboostResult, ErrorKind, TransferError};
