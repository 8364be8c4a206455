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

//! Client-Side tower Services
//!
//! # Introduction
//!
//! skydeck talks to a PDS over HTTP, and there are things we want done to every request regardless
//! of which XRPC method it targets: set the User-Agent, respect a rate limit, retry transient
//! failures. The natural home for that is [tower] middleware. The snag is that [tower-http] speaks
//! [http] requests & responses, while [reqwest] has its own types for both.
//!
//! [ReqwestService] bridges the two: it accepts an `http::Request<Bytes>`, converts it, hands it
//! to a [reqwest::Client], and converts the reply back into an `http::Response<Bytes>` (status,
//! version, headers & the fully buffered body). Any [tower] or [tower-http] layer can then be
//! stacked on top.
//!
//! [tower-http]: https://docs.rs/tower-http

use std::{
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use snafu::{Backtrace, ResultExt, Snafu};
use tower::retry::backoff::Backoff;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("While waiting for the response body, {source}"))]
    Body {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert an http::Request into a reqwest::Request: {source}"))]
    Conversion {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("[{min:?}, {max:?}] is not a valid backoff range"))]
    DurationRange {
        min: Duration,
        max: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("{value} is not a valid jitter factor (must be within [0, 100])"))]
    Jitter { value: f64, backtrace: Backtrace },
    #[snafu(display("A rate limit of {requests} requests per {per_millis}ms is not meaningful"))]
    RateLimit {
        requests: u64,
        per_millis: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("When building an http response, {source}"))]
    Response {
        source: http::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The request could not be sent: {source}"))]
    Send {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         ReqwestService                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [tower::Service] speaking [http], implemented in terms of [reqwest::Client]
#[derive(Clone, Debug, Default)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    pub fn new(client: reqwest::Client) -> ReqwestService {
        ReqwestService { client }
    }
}

async fn into_http_response(rsp: reqwest::Response) -> Result<http::Response<Bytes>> {
    let builder = rsp.headers().iter().fold(
        http::Response::builder()
            .status(rsp.status())
            .version(rsp.version()),
        |builder, (name, value)| builder.header(name, value),
    );
    builder
        .body(rsp.bytes().await.context(BodySnafu)?)
        .context(ResponseSnafu)
}

impl tower::Service<http::Request<Bytes>> for ReqwestService {
    type Response = http::Response<Bytes>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<http::Response<Bytes>>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<StdResult<(), Self::Error>> {
        // `reqwest::Client` is always ready; it pools connections internally.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Bytes>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let req = reqwest::Request::try_from(req).context(ConversionSnafu)?;
            let rsp = client.execute(req).await.context(SendSnafu)?;
            into_http_response(rsp).await
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      exponential backoffs                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Retry transient failures with exponential backoff
///
/// "Transient" means: the request never produced a response at all, or the server answered 429 or
/// 5xx. A 4xx is the server telling us something definite (you already liked that, that record is
/// gone, your token expired) and retrying won't change its mind, so those are handed straight back.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffPolicy {
    pub backoff: tower::retry::backoff::ExponentialBackoff,
    pub num_attempts: usize,
}

/// True if a response with this status is worth trying again
pub fn is_transient(status: http::StatusCode) -> bool {
    status == http::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl<Req: Clone, B>
    tower::retry::Policy<
        Req,
        http::Response<B>,
        Box<dyn std::error::Error + Send + Sync + 'static>,
    > for ExponentialBackoffPolicy
{
    type Future =
        <tower::retry::backoff::ExponentialBackoff as tower::retry::backoff::Backoff>::Future;

    fn retry(
        &mut self,
        _: &mut Req,
        result: &mut StdResult<
            http::Response<B>,
            Box<dyn std::error::Error + Send + Sync + 'static>,
        >,
    ) -> Option<Self::Future> {
        let transient = match result {
            Ok(rsp) => is_transient(rsp.status()),
            Err(_) => true,
        };
        if transient && self.num_attempts > 0 {
            self.num_attempts -= 1;
            Some(self.backoff.next_backoff())
        } else {
            None
        }
    }

    fn clone_request(&mut self, req: &Req) -> Option<Req> {
        Some(req.clone())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       configuration types                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRateLimit {
    requests: u64,
    #[serde(rename = "per-millis")]
    per_millis: u64,
}

/// Express a rate limit in terms of requests per duration
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "RawRateLimit")]
pub struct RateLimit {
    requests: u64,
    per: Duration,
}

impl RateLimit {
    pub fn new(requests: u64, per_millis: u64) -> Result<RateLimit> {
        if requests == 0 || per_millis == 0 {
            RateLimitSnafu {
                requests,
                per_millis,
            }
            .fail()
        } else {
            Ok(RateLimit {
                requests,
                per: Duration::from_millis(per_millis),
            })
        }
    }
    pub fn requests(&self) -> u64 {
        self.requests
    }
    pub fn per(&self) -> Duration {
        self.per
    }
}

impl TryFrom<RawRateLimit> for RateLimit {
    type Error = Error;

    fn try_from(raw: RawRateLimit) -> StdResult<Self, Self::Error> {
        RateLimit::new(raw.requests, raw.per_millis)
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        // Comfortably under the PDS's published per-account write limits.
        RateLimit {
            requests: 5,
            per: Duration::from_secs(1),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackoff {
    #[serde(rename = "min-millis")]
    min_millis: u64,
    #[serde(rename = "max-millis")]
    max_millis: u64,
    jitter: f64,
    #[serde(rename = "num-attempts")]
    num_attempts: usize,
}

/// Parameters for an exponential backoff policy
///
/// Each delay is the exponentially growing base, plus a random fraction of up to `jitter` times
/// that base, capped at `upper`. So `jitter` is a multiplier, not a percentage: 0 disables it, 1
/// allows up to double the base.
///
/// Construction guarantees `0 < lower <= upper` and a finite `jitter` in `[0, 100]`, which is
/// everything [tower::retry::backoff::ExponentialBackoffMaker] will check.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "RawBackoff")]
pub struct ExponentialBackoffParameters {
    lower: Duration,
    upper: Duration,
    jitter: f64,
    num_attempts: usize,
}

impl ExponentialBackoffParameters {
    pub fn new(
        lower: Duration,
        upper: Duration,
        jitter: f64,
        num_attempts: usize,
    ) -> Result<ExponentialBackoffParameters> {
        if lower > upper || upper.is_zero() {
            return DurationRangeSnafu {
                min: lower,
                max: upper,
            }
            .fail();
        }
        if !jitter.is_finite() || !(0.0..=100.0).contains(&jitter) {
            return JitterSnafu { value: jitter }.fail();
        }
        Ok(ExponentialBackoffParameters {
            lower,
            upper,
            jitter,
            num_attempts,
        })
    }
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
    pub fn lower(&self) -> &Duration {
        &self.lower
    }
    pub fn num_attempts(&self) -> usize {
        self.num_attempts
    }
    pub fn upper(&self) -> &Duration {
        &self.upper
    }
}

impl TryFrom<RawBackoff> for ExponentialBackoffParameters {
    type Error = Error;

    fn try_from(raw: RawBackoff) -> StdResult<Self, Self::Error> {
        ExponentialBackoffParameters::new(
            Duration::from_millis(raw.min_millis),
            Duration::from_millis(raw.max_millis),
            raw.jitter,
            raw.num_attempts,
        )
    }
}

impl Default for ExponentialBackoffParameters {
    fn default() -> Self {
        ExponentialBackoffParameters {
            lower: Duration::from_millis(500),
            upper: Duration::from_secs(3),
            jitter: 10.0,
            num_attempts: 3,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tower::retry::{
        Policy,
        backoff::{ExponentialBackoffMaker, MakeBackoff},
    };

    fn policy(num_attempts: usize) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy {
            backoff: ExponentialBackoffMaker::new(
                Duration::from_millis(1),
                Duration::from_millis(2),
                0.0,
                tower::util::rng::HasherRng::new(),
            )
            .unwrap()
            .make_backoff(),
            num_attempts,
        }
    }

    fn rsp(status: u16) -> http::Response<()> {
        http::Response::builder().status(status).body(()).unwrap()
    }

    // The backoff sleeps on the tokio timer, so these need a runtime
    #[tokio::test]
    async fn retries_only_transient_failures() {
        type Res = StdResult<http::Response<()>, Box<dyn std::error::Error + Send + Sync>>;
        let mut p = policy(5);
        let mut req = ();
        for (status, retry) in [
            (200, false),
            (401, false),
            (404, false),
            (409, false),
            (429, true),
            (502, true),
        ] {
            let mut result: Res = Ok(rsp(status));
            assert_eq!(p.retry(&mut req, &mut result).is_some(), retry, "{status}");
        }
        let mut result: Res = Err("connection reset".into());
        assert!(p.retry(&mut req, &mut result).is_some());
    }

    #[tokio::test]
    async fn gives_up_after_num_attempts() {
        let mut p = policy(1);
        let mut req = ();
        let mut result: StdResult<http::Response<()>, Box<dyn std::error::Error + Send + Sync>> =
            Ok(rsp(503));
        assert!(p.retry(&mut req, &mut result).is_some());
        assert!(p.retry(&mut req, &mut result).is_none());
    }

    #[test]
    fn validated_parameters() {
        assert!(RateLimit::new(0, 1000).is_err());
        assert!(RateLimit::new(3, 0).is_err());
        assert_eq!(
            RateLimit::new(3, 1000).unwrap().per(),
            Duration::from_secs(1)
        );
        assert!(
            ExponentialBackoffParameters::new(
                Duration::from_secs(3),
                Duration::from_secs(1),
                10.0,
                3
            )
            .is_err()
        );
        assert!(
            ExponentialBackoffParameters::new(
                Duration::from_secs(1),
                Duration::from_secs(3),
                f64::NAN,
                3
            )
            .is_err()
        );
        assert!(
            ExponentialBackoffParameters::new(
                Duration::from_secs(1),
                Duration::from_secs(3),
                100.5,
                3
            )
            .is_err()
        );
        // A multiplier, not a percentage: the top of the range is fine, & so is no jitter at all
        for jitter in [0.0, 1.0, 100.0] {
            let params = ExponentialBackoffParameters::new(
                Duration::from_secs(1),
                Duration::from_secs(3),
                jitter,
                3,
            )
            .unwrap();
            assert!(
                ExponentialBackoffMaker::new(
                    *params.lower(),
                    *params.upper(),
                    params.jitter(),
                    tower::util::rng::HasherRng::new(),
                )
                .is_ok()
            );
        }
    }
}
