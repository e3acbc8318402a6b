// SPDX-License-Identifier: MIT

pub mod chartflow;
pub mod engine;
