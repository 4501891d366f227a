/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Integration tests for the lifecycle management core
//!
//! These tests drive the public [`lifecycle::LifecycleService`] API
//! end to end over temp-dir fixtures with explicitly aged files.

#[cfg(test)]
mod common;
#[cfg(test)]
mod persistence;
#[cfg(test)]
mod scenarios;
