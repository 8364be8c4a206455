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

use itertools::Itertools;
use snafu::{ResultExt, Snafu};
use tracing::debug;

use skydeck::{feed::FeedAssembler, remote::FeedSource};
use skydeck_shared::{EngagementKind, Marker, PostView};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While fetching the timeline, {source}"))]
    Timeline { source: skydeck::feed::Error },
}

type Result<T> = std::result::Result<T, Error>;

fn engagement(post: &PostView, kind: EngagementKind) -> String {
    let flag = match post.marker(kind) {
        Some(Marker::Pending) => "?",
        Some(Marker::Record(_)) => "*",
        None => "",
    };
    format!("{}s: {}{flag}", kind, post.count(kind))
}

/// Render one (materialized) post for the terminal
///
/// A trailing `*` on a count means the viewer has engaged; `?` means that's still on its way.
pub fn render(post: &PostView) -> String {
    let counts = [
        engagement(post, EngagementKind::Like),
        engagement(post, EngagementKind::Repost),
        format!("replies: {}", post.reply_count),
    ]
    .iter()
    .join("  ");
    format!(
        "@{}: {}\n    {counts}\n    {}",
        post.author.handle,
        post.text().unwrap_or("<no text>").lines().join(" / "),
        post.uri
    )
}

/// Fetch up to `pages` pages of the timeline & print them
pub async fn timeline<S: FeedSource>(feed: &mut FeedAssembler<S>, pages: usize) -> Result<()> {
    for _ in 0..pages {
        if !feed.has_more() {
            break;
        }
        let added = feed.load_more().await.context(TimelineSnafu)?;
        debug!("Fetched {added} posts");
    }
    feed.visible_posts()
        .iter()
        .for_each(|post| println!("{}\n", render(post)));
    Ok(())
}
