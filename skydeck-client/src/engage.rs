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

//! Toggle a like or repost from the command line.

use snafu::{OptionExt, ResultExt, Snafu};

use skydeck::{
    interaction::{InteractionController, Outcome},
    remote::FeedSource,
};
use skydeck_shared::{AtUri, EngagementKind};

use crate::timeline::render;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While fetching {uri}, {source}"))]
    Fetch {
        uri: AtUri,
        source: skydeck::remote::Error,
    },
    #[snafu(display("No such post: {uri}"))]
    NoSuchPost { uri: AtUri },
    #[snafu(display("{source}"))]
    Toggle {
        source: skydeck::interaction::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Toggle the viewer's `kind` of the post at `uri` & print the result
///
/// A rolled-back toggle isn't an error; we print the notice & return the [Outcome].
pub async fn engage<S: FeedSource>(
    source: &S,
    controller: &InteractionController,
    kind: EngagementKind,
    uri: &AtUri,
) -> Result<Outcome> {
    let post = source
        .fetch_posts(std::slice::from_ref(uri))
        .await
        .context(FetchSnafu { uri: uri.clone() })?
        .into_iter()
        .next()
        .context(NoSuchPostSnafu { uri: uri.clone() })?;

    let outcome = controller.toggle(kind, &post).await.context(ToggleSnafu)?;
    if let Some(text) = describe(&outcome) {
        println!("{text}");
    }
    println!("{}", render(&controller.reader().materialize(&post)));
    Ok(outcome)
}

/// What to tell the user about `outcome`, beyond the post itself
pub fn describe(outcome: &Outcome) -> Option<String> {
    match outcome {
        Outcome::Settled => None,
        Outcome::AlreadyInEffect => Some("(the server already had that)".to_owned()),
        Outcome::RolledBack(notice) => Some(format!("{notice}: {}", notice.reason)),
    }
}
