// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of skydeck.
//
// skydeck is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// skydeck is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with skydeck.  If not,
// see <http://www.gnu.org/licenses/>.

//! # skydeck
//!
//! Optimistic likes & reposts over an AT Protocol timeline.
//!
//! The pieces, leaf first:
//!
//! - [shadow]: client-side overrides of post engagement state, keyed by post
//! - [materialize]: lay those overrides over the canonical posts for display
//! - [interaction]: toggle a like or repost, optimistically, rolling back on failure
//! - [feed]: page through the timeline, materializing each post as it's displayed
//!
//! [remote] defines what we need from the network; [xrpc] & [session] provide it by talking to
//! a PDS. [config] is the configuration file format.

pub mod config;
pub mod feed;
pub mod interaction;
pub mod materialize;
pub mod remote;
pub mod session;
pub mod shadow;
pub mod xrpc;
