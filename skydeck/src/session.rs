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

//! # Sessions
//!
//! A PDS session is a DID plus a pair of bearer tokens: a short-lived access token sent with every
//! request, and a longer-lived refresh token good for exactly one thing, getting a new pair. Where
//! the tokens are kept between runs is the caller's business.

use bytes::Bytes;
use http::{
    Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use secrecy::{ExposeSecret, SecretString};
use snafu::ResultExt;
use tracing::{info, instrument};
use url::Url;

use skydeck_shared::{
    Did,
    api::{CREATE_SESSION, CreateSessionReq, REFRESH_SESSION, SessionRsp},
};

use crate::{
    remote::{DecodeSnafu, EncodeSnafu, RequestSnafu, Result},
    xrpc::{XrpcService, endpoint, send},
};

#[derive(Clone, Debug)]
pub struct Session {
    did: Did,
    handle: String,
    access: SecretString,
    refresh: Option<SecretString>,
}

impl From<SessionRsp> for Session {
    fn from(rsp: SessionRsp) -> Self {
        Session {
            did: rsp.did,
            handle: rsp.handle,
            access: rsp.access_jwt,
            refresh: Some(rsp.refresh_jwt),
        }
    }
}

impl Session {
    /// Build a session from tokens obtained elsewhere (configuration, say)
    ///
    /// Without a refresh token, the session simply ends when the access token expires.
    pub fn new(
        did: Did,
        handle: Option<String>,
        access: SecretString,
        refresh: Option<SecretString>,
    ) -> Session {
        Session {
            handle: handle.unwrap_or_else(|| did.to_string()),
            did,
            access,
            refresh,
        }
    }
    pub fn did(&self) -> &Did {
        &self.did
    }
    pub fn handle(&self) -> &str {
        &self.handle
    }
    pub fn access(&self) -> &SecretString {
        &self.access
    }
    pub fn refresh_token(&self) -> Option<&SecretString> {
        self.refresh.as_ref()
    }
}

/// Log in to the PDS at `pds` with an identifier (handle or DID) & password
#[instrument(skip(client, password))]
pub async fn login<C: XrpcService>(
    client: &C,
    pds: &Url,
    identifier: &str,
    password: &SecretString,
) -> Result<Session> {
    let body = serde_json::to_vec(&CreateSessionReq {
        identifier,
        password: password.expose_secret(),
    })
    .context(EncodeSnafu)?;
    let req = http::Request::builder()
        .method(Method::POST)
        .uri(endpoint(pds, CREATE_SESSION)?.as_str())
        .header(CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))
        .context(RequestSnafu)?;
    let session: Session = serde_json::from_slice::<SessionRsp>(&send(client, req).await?)
        .context(DecodeSnafu)?
        .into();
    info!("Logged in as {} ({})", session.handle, session.did);
    Ok(session)
}

/// Trade `refresh` for a new session
#[instrument(skip_all)]
pub async fn refresh<C: XrpcService>(
    client: &C,
    pds: &Url,
    refresh: &SecretString,
) -> Result<Session> {
    let req = http::Request::builder()
        .method(Method::POST)
        .uri(endpoint(pds, REFRESH_SESSION)?.as_str())
        .header(AUTHORIZATION, format!("Bearer {}", refresh.expose_secret()))
        .body(Bytes::new())
        .context(RequestSnafu)?;
    let session: Session = serde_json::from_slice::<SessionRsp>(&send(client, req).await?)
        .context(DecodeSnafu)?
        .into();
    info!("Refreshed the session for {}", session.did);
    Ok(session)
}
