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

//! # Talking to a PDS
//!
//! [XrpcClient] implements [FeedSource] & [MutationService] by making XRPC calls against the
//! viewer's PDS. It's generic over the underlying tower [Service]; [make_client] builds the one we
//! use in practice: a [reqwest::Client] with headers set, a rate limit, and retries on transient
//! failures.
//!
//! The one piece of session management that lives here: if a call fails for want of
//! authorization & we hold a refresh token, we refresh the session & send the call once more.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{
    HeaderValue, Method, StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tap::Pipe;
use tokio::sync::RwLock;
use tower::{
    Service, ServiceBuilder, ServiceExt,
    buffer::BufferLayer,
    limit::RateLimitLayer,
    retry::{
        RetryLayer,
        backoff::{ExponentialBackoffMaker, InvalidBackoff, MakeBackoff},
    },
    util::{BoxCloneSyncService, rng::HasherRng},
};
use tower_http::set_header::SetRequestHeaderLayer;
use tracing::{debug, instrument, warn};
use url::Url;

use skydeck_shared::{
    AtUri, Cid, EngagementKind, PostView,
    api::{
        CREATE_RECORD, CreateRecordReq, CreateRecordRsp, DELETE_RECORD, DeleteRecordReq,
        EngagementRecord, GET_POSTS, GET_TIMELINE, GetPostsRsp, GetTimelineReq, GetTimelineRsp,
        MAX_PAGE_SIZE, XrpcErrorRsp,
    },
    service::{
        ExponentialBackoffParameters, ExponentialBackoffPolicy, RateLimit, ReqwestService,
        is_transient,
    },
};

use crate::{
    remote::{
        self, DecodeSnafu, EncodeSnafu, FeedSource, MalformedRecordSnafu, MutationService,
        QuerySnafu, RequestSnafu, TimelinePage, TransportSnafu, UrlSnafu,
    },
    session::{self, Session},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid backoff parameters: {source}"))]
    Backoff {
        source: InvalidBackoff,
        backtrace: Backtrace,
    },
    #[snafu(display("{user_agent} is not a valid User-Agent: {source}"))]
    UserAgent {
        user_agent: String,
        source: http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The most posts `getPosts` will return in one call
const MAX_POSTS_PER_CALL: usize = 25;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Any tower [Service] that can carry XRPC calls
pub trait XrpcService:
    Service<
        http::Request<Bytes>,
        Response = http::Response<Bytes>,
        Error = BoxError,
        Future: Send,
    > + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> XrpcService for T where
    T: Service<
            http::Request<Bytes>,
            Response = http::Response<Bytes>,
            Error = BoxError,
            Future: Send,
        > + Clone
        + Send
        + Sync
        + 'static
{
}

/// The client service returned by [make_client]
pub type ClientService =
    BoxCloneSyncService<http::Request<Bytes>, http::Response<Bytes>, BoxError>;

/// Create an XRPC client service
///
/// Return a [reqwest::Client] wrapped in tower layers that will:
///
/// - set the User-Agent & Accept headers on all outgoing requests
/// - rate-limit requests according to `rate_limit`
/// - retry transient failures with exponential backoff
///
/// Must be called from within a tokio runtime.
pub fn make_client(
    user_agent: &str,
    rate_limit: &RateLimit,
    backoff: &ExponentialBackoffParameters,
) -> Result<ClientService> {
    let mut backoff_maker = ExponentialBackoffMaker::new(
        *backoff.lower(),
        *backoff.upper(),
        backoff.jitter(),
        HasherRng::new(),
    )
    .context(BackoffSnafu)?;
    let user_agent_value = HeaderValue::from_str(user_agent).context(UserAgentSnafu {
        user_agent: user_agent.to_owned(),
    })?;
    ServiceBuilder::new()
        .layer(RetryLayer::new(ExponentialBackoffPolicy {
            backoff: backoff_maker.make_backoff(),
            num_attempts: backoff.num_attempts(),
        }))
        // `RetryLayer` needs a `Clone` service, which `RateLimit` is not; `Buffer` is, at the cost
        // of boxing the error type.
        .layer(BufferLayer::<http::Request<Bytes>>::new(1024))
        .layer(RateLimitLayer::new(rate_limit.requests(), rate_limit.per()))
        .layer(SetRequestHeaderLayer::overriding(USER_AGENT, user_agent_value))
        .layer(SetRequestHeaderLayer::if_not_present(
            ACCEPT,
            HeaderValue::from_static("application/json"),
        ))
        .service(ReqwestService::default())
        .pipe(BoxCloneSyncService::new)
        .pipe(Ok)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       requests & responses                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The URL for XRPC method `nsid` on `pds`
pub(crate) fn endpoint(pds: &Url, nsid: &str) -> remote::Result<Url> {
    pds.join(&format!("xrpc/{nsid}"))
        .context(UrlSnafu { nsid: nsid.to_owned() })
}

/// Work out what a non-2xx response means
pub(crate) fn classify(status: StatusCode, body: &[u8]) -> remote::Error {
    // Not every error response carries an XRPC error body (a proxy's 502, say)
    let XrpcErrorRsp { error, message } = serde_json::from_slice(body).unwrap_or_default();
    let code = error.as_str();
    if status == StatusCode::UNAUTHORIZED
        || matches!(code, "ExpiredToken" | "InvalidToken" | "AuthenticationRequired")
    {
        remote::Error::Unauthorized {
            message: match (message, error.is_empty()) {
                (Some(message), _) => message,
                (None, true) => status.to_string(),
                (None, false) => error,
            },
        }
    } else if status == StatusCode::CONFLICT || code == "DuplicateRecord" {
        remote::Error::Duplicate
    } else if status == StatusCode::NOT_FOUND || code == "RecordNotFound" {
        remote::Error::NotFound
    } else if is_transient(status) {
        remote::Error::Transient {
            status: status.as_u16(),
        }
    } else {
        remote::Error::Rejected {
            status: status.as_u16(),
            error,
            message,
        }
    }
}

/// Send `req` on `client`; return the response body if the call succeeded
pub(crate) async fn send<C: XrpcService>(
    client: &C,
    req: http::Request<Bytes>,
) -> remote::Result<Bytes> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let mut client = client.clone();
    let rsp = client
        .ready()
        .await
        .context(TransportSnafu)?
        .call(req)
        .await
        .context(TransportSnafu)?;
    let status = rsp.status();
    debug!("{method} {uri}: {status}");
    if status.is_success() {
        Ok(rsp.into_body())
    } else {
        Err(classify(status, rsp.body()))
    }
}

fn get(url: &Url, access: &SecretString) -> remote::Result<http::Request<Bytes>> {
    http::Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .header(AUTHORIZATION, format!("Bearer {}", access.expose_secret()))
        .body(Bytes::new())
        .context(RequestSnafu)
}

fn post(url: &Url, access: &SecretString, body: &Bytes) -> remote::Result<http::Request<Bytes>> {
    http::Request::builder()
        .method(Method::POST)
        .uri(url.as_str())
        .header(AUTHORIZATION, format!("Bearer {}", access.expose_secret()))
        .header(CONTENT_TYPE, "application/json")
        .body(body.clone())
        .context(RequestSnafu)
}

fn to_json<T: Serialize>(body: &T) -> remote::Result<Bytes> {
    serde_json::to_vec(body).context(EncodeSnafu).map(Bytes::from)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           XrpcClient                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [FeedSource] & [MutationService] backed by the viewer's PDS
///
/// Clones share the session, so a refresh through any one of them is seen by all.
#[derive(Clone, Debug)]
pub struct XrpcClient<C> {
    client: C,
    pds: Url,
    session: Arc<RwLock<Session>>,
    page_size: u16,
}

impl<C: XrpcService> XrpcClient<C> {
    /// `page_size` is clamped to what `getTimeline` accepts
    pub fn new(client: C, pds: Url, session: Session, page_size: u16) -> XrpcClient<C> {
        XrpcClient {
            client,
            pds,
            session: Arc::new(RwLock::new(session)),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }
    /// The session as it stands (it may have been refreshed since construction)
    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }
    /// Build a request with the current access token & send it; if the server says we're not
    /// authorized, refresh the session & try once more
    async fn send_authorized<F>(&self, make_request: F) -> remote::Result<Bytes>
    where
        F: Fn(&SecretString) -> remote::Result<http::Request<Bytes>> + Send + Sync,
    {
        let access = self.session.read().await.access().clone();
        match send(&self.client, make_request(&access)?).await {
            Err(err) if err.is_auth() => {
                if !self.refresh_after(&access).await? {
                    return Err(err);
                }
                let access = self.session.read().await.access().clone();
                send(&self.client, make_request(&access)?).await
            }
            result => result,
        }
    }
    /// Replace the session whose access token was `stale`; return false if we've no means to
    async fn refresh_after(&self, stale: &SecretString) -> remote::Result<bool> {
        let mut session = self.session.write().await;
        if session.access().expose_secret() != stale.expose_secret() {
            // Someone beat us to it
            return Ok(true);
        }
        let Some(refresh) = session.refresh_token().cloned() else {
            warn!("The access token was refused & there's no refresh token");
            return Ok(false);
        };
        *session = session::refresh(&self.client, &self.pds, &refresh).await?;
        Ok(true)
    }
}

#[async_trait]
impl<C: XrpcService> FeedSource for XrpcClient<C> {
    #[instrument(skip(self))]
    async fn fetch_timeline_page(&self, cursor: Option<&str>) -> remote::Result<TimelinePage> {
        let mut url = endpoint(&self.pds, GET_TIMELINE)?;
        url.set_query(Some(
            &serde_urlencoded::to_string(GetTimelineReq {
                limit: Some(self.page_size),
                cursor: cursor.map(str::to_owned),
            })
            .context(QuerySnafu)?,
        ));
        let body = self.send_authorized(|access| get(&url, access)).await?;
        let rsp: GetTimelineRsp = serde_json::from_slice(&body).context(DecodeSnafu)?;
        // A cursor with an empty page would have us paging forever
        let next_cursor = if rsp.feed.is_empty() { None } else { rsp.cursor };
        Ok(TimelinePage {
            posts: rsp.feed.into_iter().map(|item| item.post).collect(),
            next_cursor,
        })
    }
    #[instrument(skip(self), fields(n = uris.len()))]
    async fn fetch_posts(&self, uris: &[AtUri]) -> remote::Result<Vec<PostView>> {
        let mut posts = Vec::with_capacity(uris.len());
        for chunk in uris.chunks(MAX_POSTS_PER_CALL) {
            let mut url = endpoint(&self.pds, GET_POSTS)?;
            url.query_pairs_mut()
                .extend_pairs(chunk.iter().map(|uri| ("uris", &**uri)));
            let body = self.send_authorized(|access| get(&url, access)).await?;
            let rsp: GetPostsRsp = serde_json::from_slice(&body).context(DecodeSnafu)?;
            posts.extend(rsp.posts);
        }
        Ok(posts)
    }
}

#[async_trait]
impl<C: XrpcService> MutationService for XrpcClient<C> {
    #[instrument(skip(self))]
    async fn create_engagement(
        &self,
        kind: EngagementKind,
        subject_uri: &AtUri,
        subject_cid: &Cid,
    ) -> remote::Result<AtUri> {
        let url = endpoint(&self.pds, CREATE_RECORD)?;
        let body = to_json(&CreateRecordReq {
            repo: self.session.read().await.did().clone(),
            collection: kind.collection().to_owned(),
            record: EngagementRecord::new(kind, subject_uri, subject_cid, Utc::now()),
        })?;
        let body = self
            .send_authorized(|access| post(&url, access, &body))
            .await?;
        let rsp: CreateRecordRsp = serde_json::from_slice(&body).context(DecodeSnafu)?;
        debug!("Created {} ({})", rsp.uri, rsp.cid);
        Ok(rsp.uri)
    }
    #[instrument(skip(self))]
    async fn delete_engagement(&self, record: &AtUri) -> remote::Result<()> {
        let (collection, rkey) = record
            .collection()
            .zip(record.rkey())
            .context(MalformedRecordSnafu {
                uri: record.clone(),
            })?;
        let url = endpoint(&self.pds, DELETE_RECORD)?;
        let body = to_json(&DeleteRecordReq {
            repo: self.session.read().await.did().clone(),
            collection: collection.to_owned(),
            rkey: rkey.to_owned(),
        })?;
        self.send_authorized(|access| post(&url, access, &body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use skydeck_shared::Did;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path, query_param},
    };

    fn post_json(n: usize, likes: u64) -> serde_json::Value {
        serde_json::json!({
            "uri": format!("at://did:plc:alice/app.bsky.feed.post/{n}"),
            "cid": format!("bafyrei{n}"),
            "author": {"did": "did:plc:alice", "handle": "alice.test"},
            "record": {"$type": "app.bsky.feed.post", "text": format!("post #{n}")},
            "likeCount": likes
        })
    }

    fn session(refresh: Option<&str>) -> Session {
        Session::new(
            Did::new("did:plc:me").unwrap(),
            Some("me.test".to_owned()),
            SecretString::from("access-1".to_owned()),
            refresh.map(|s| SecretString::from(s.to_owned())),
        )
    }

    fn fast_backoff() -> ExponentialBackoffParameters {
        ExponentialBackoffParameters::new(Duration::from_millis(1), Duration::from_millis(2), 0.0, 2)
            .unwrap()
    }

    fn xrpc(server: &MockServer, refresh: Option<&str>) -> XrpcClient<ClientService> {
        XrpcClient::new(
            make_client("skydeck-test/0.1", &RateLimit::default(), &fast_backoff()).unwrap(),
            Url::parse(&server.uri()).unwrap(),
            session(refresh),
            2,
        )
    }

    #[test]
    fn status_mapping() {
        let body = |error: &str| serde_json::to_vec(&serde_json::json!({"error": error})).unwrap();
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, &body("ExpiredToken")),
            remote::Error::Unauthorized { .. }
        ));
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, b""),
            remote::Error::Unauthorized { .. }
        ));
        assert!(matches!(
            classify(StatusCode::CONFLICT, b""),
            remote::Error::Duplicate
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, &body("DuplicateRecord")),
            remote::Error::Duplicate
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, &body("RecordNotFound")),
            remote::Error::NotFound
        ));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, b"<html>"),
            remote::Error::Transient { status: 503 }
        ));
        match classify(StatusCode::BAD_REQUEST, &body("InvalidRequest")) {
            remote::Error::Rejected { status, error, .. } => {
                assert_eq!(status, 400);
                assert_eq!(error, "InvalidRequest");
            }
            err => panic!("Expected Rejected, got {err:?}"),
        }
    }

    #[tokio::test]
    async fn pages_through_the_timeline() {
        let server = MockServer::start().await;
        // More specific first; wiremock tries mocks in the order they were mounted
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getTimeline"))
            .and(query_param("cursor", "c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "feed": [{"post": post_json(3, 0)}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getTimeline"))
            .and(query_param("limit", "2"))
            .and(header("Authorization", "Bearer access-1"))
            .and(header("User-Agent", "skydeck-test/0.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "feed": [{"post": post_json(1, 3)}, {"post": post_json(2, 0), "reason": {}}],
                "cursor": "c1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = xrpc(&server, None);
        let page = client.fetch_timeline_page(None).await.unwrap();
        assert_eq!(page.posts.len(), 2);
        assert_eq!(page.posts[0].like_count, 3);
        assert_eq!(page.next_cursor.as_deref(), Some("c1"));
        let page = client.fetch_timeline_page(Some("c1")).await.unwrap();
        assert_eq!(page.posts.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn fetches_posts_by_uri() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getPosts"))
            .and(query_param("uris", "at://did:plc:alice/app.bsky.feed.post/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"posts": [post_json(1, 4)]})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let client = xrpc(&server, None);
        let posts = client
            .fetch_posts(&[AtUri::new("at://did:plc:alice/app.bsky.feed.post/1").unwrap()])
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].like_count, 4);
        assert!(client.fetch_posts(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn creates_and_deletes_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(serde_json::json!({
                "repo": "did:plc:me",
                "collection": "app.bsky.feed.like",
                "record": {
                    "$type": "app.bsky.feed.like",
                    "subject": {
                        "uri": "at://did:plc:alice/app.bsky.feed.post/1",
                        "cid": "bafyrei1"
                    }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uri": "at://did:plc:me/app.bsky.feed.like/3kxyz",
                "cid": "bafyreilike"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(body_partial_json(serde_json::json!({
                "repo": "did:plc:me",
                "collection": "app.bsky.feed.like",
                "rkey": "3kxyz"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = xrpc(&server, None);
        let record = client
            .create_engagement(
                EngagementKind::Like,
                &AtUri::new("at://did:plc:alice/app.bsky.feed.post/1").unwrap(),
                &Cid::new("bafyrei1").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(record.as_ref(), "at://did:plc:me/app.bsky.feed.like/3kxyz");
        client.delete_engagement(&record).await.unwrap();

        assert!(matches!(
            client
                .delete_engagement(&AtUri::new("at://did:plc:me").unwrap())
                .await,
            Err(remote::Error::MalformedRecord { .. })
        ));
    }

    #[tokio::test]
    async fn refreshes_once_on_expired_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(header("Authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "ExpiredToken",
                "message": "Token has expired"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(header("Authorization", "Bearer access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.refreshSession"))
            .and(header("Authorization", "Bearer refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "did": "did:plc:me",
                "handle": "me.test",
                "accessJwt": "access-2",
                "refreshJwt": "refresh-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = xrpc(&server, Some("refresh-1"));
        client
            .delete_engagement(&AtUri::new("at://did:plc:me/app.bsky.feed.repost/1").unwrap())
            .await
            .unwrap();
        assert_eq!(client.session().await.access().expose_secret(), "access-2");
    }

    #[tokio::test]
    async fn no_refresh_token_means_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        let client = xrpc(&server, None);
        let err = client
            .create_engagement(
                EngagementKind::Repost,
                &AtUri::new("at://did:plc:alice/app.bsky.feed.post/1").unwrap(),
                &Cid::new("bafyrei1").unwrap(),
            )
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(503))
            // The first attempt plus two retries
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "error": "DuplicateRecord"
            })))
            // 4xx are never retried
            .expect(1)
            .mount(&server)
            .await;
        let client = xrpc(&server, None);
        let err = client
            .create_engagement(
                EngagementKind::Like,
                &AtUri::new("at://did:plc:alice/app.bsky.feed.post/1").unwrap(),
                &Cid::new("bafyrei1").unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, remote::Error::Transient { status: 503 }));
        let err = client
            .delete_engagement(&AtUri::new("at://did:plc:me/app.bsky.feed.like/1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_success_equivalent(true));
        assert!(!err.is_success_equivalent(false));
    }
}
