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

//! # skydeck configuration
//!
//! Configuration is TOML, versioned by an internal `version` tag so the format can change without
//! breaking existing files:
//!
//! ```toml
//! version = "1"
//! pds = "https://bsky.social"
//! identifier = "me.bsky.social"
//! page-size = 25
//!
//! [rate-limit]
//! requests = 5
//! per-millis = 1000
//! ```
//!
//! Items likely to change from one invocation to the next (the PDS, the tokens) may also be given
//! on the command line, which takes precedence; see the `set_*` methods.

use std::{io, num::NonZeroUsize, path::Path};

use secrecy::SecretString;
use serde::Deserialize;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use url::Url;

use skydeck_shared::{
    Did,
    service::{ExponentialBackoffParameters, RateLimit},
};

use crate::shadow;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("While attempting to read {path:?}, {source}"))]
    BadConfig {
        path: std::path::PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While parsing the configuration file, {source}"))]
    Parse {
        source: toml::de::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default number of posts requested per timeline page
pub const DEFAULT_PAGE_SIZE: u16 = 50;

/// Current configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigV1 {
    /// The viewer's Personal Data Server
    pub pds: Option<Url>,
    /// Handle or DID used to log in
    pub identifier: Option<String>,
    pub did: Option<Did>,
    pub token: Option<SecretString>,
    #[serde(rename = "refresh-token")]
    pub refresh_token: Option<SecretString>,
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimit,
    pub backoff: ExponentialBackoffParameters,
    /// The most shadows to keep at once
    #[serde(rename = "shadow-capacity")]
    pub shadow_capacity: NonZeroUsize,
    #[serde(rename = "page-size")]
    pub page_size: u16,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            pds: None,
            identifier: None,
            did: None,
            token: None,
            refresh_token: None,
            rate_limit: RateLimit::default(),
            backoff: ExponentialBackoffParameters::default(),
            shadow_capacity: shadow::DEFAULT_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ConfigV1 {
    pub fn set_pds(self, pds: Option<&Url>) -> Self {
        match pds {
            Some(pds) => ConfigV1 {
                pds: Some(pds.clone()),
                ..self
            },
            None => self,
        }
    }
    pub fn set_token(self, token: Option<&SecretString>) -> Self {
        match token {
            Some(token) => ConfigV1 {
                token: Some(token.clone()),
                ..self
            },
            None => self,
        }
    }
    pub fn set_did(self, did: Option<&Did>) -> Self {
        match did {
            Some(did) => ConfigV1 {
                did: Some(did.clone()),
                ..self
            },
            None => self,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "version", deny_unknown_fields)] // tag "internally"
pub enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::V1(ConfigV1::default())
    }
}

impl Configuration {
    /// Read the configuration file at `path`
    ///
    /// If `path` is merely the default location (the user didn't name it), it's fine for there to
    /// be nothing there; we just use defaults. Any other failure to read it is an error.
    pub fn read(path: &Path, path_is_default: bool) -> Result<Configuration> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).context(ParseSnafu),
            Err(err) if err.kind() == io::ErrorKind::NotFound && path_is_default => {
                Ok(Configuration::default())
            }
            Err(err) => Err(BadConfigSnafu {
                path: path.to_path_buf(),
            }
            .into_error(err)),
        }
    }
    fn v1(&self) -> &ConfigV1 {
        match self {
            Configuration::V1(config_v1) => config_v1,
        }
    }
    pub fn set_pds(self, pds: Option<&Url>) -> Self {
        match self {
            Configuration::V1(config_v1) => Configuration::V1(config_v1.set_pds(pds)),
        }
    }
    pub fn set_token(self, token: Option<&SecretString>) -> Self {
        match self {
            Configuration::V1(config_v1) => Configuration::V1(config_v1.set_token(token)),
        }
    }
    pub fn set_did(self, did: Option<&Did>) -> Self {
        match self {
            Configuration::V1(config_v1) => Configuration::V1(config_v1.set_did(did)),
        }
    }
    pub fn pds(&self) -> Option<&Url> {
        self.v1().pds.as_ref()
    }
    pub fn identifier(&self) -> Option<&str> {
        self.v1().identifier.as_deref()
    }
    pub fn did(&self) -> Option<&Did> {
        self.v1().did.as_ref()
    }
    pub fn token(&self) -> Option<&SecretString> {
        self.v1().token.as_ref()
    }
    pub fn refresh_token(&self) -> Option<&SecretString> {
        self.v1().refresh_token.as_ref()
    }
    pub fn rate_limit(&self) -> &RateLimit {
        &self.v1().rate_limit
    }
    pub fn backoff(&self) -> &ExponentialBackoffParameters {
        &self.v1().backoff
    }
    pub fn shadow_capacity(&self) -> NonZeroUsize {
        self.v1().shadow_capacity
    }
    pub fn page_size(&self) -> u16 {
        self.v1().page_size
    }
}
