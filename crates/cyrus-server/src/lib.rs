// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod admin;
mod oauth;
mod server;

pub use admin::{AdminState, SessionLister};
pub use oauth::{OauthBroker, OauthError};
pub use server::{ServerHandle, SharedServer};
