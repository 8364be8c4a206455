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

use secrecy::{ExposeSecret, SecretString};
use snafu::{ResultExt, Snafu};
use url::Url;

use skydeck::{
    session::{self, Session},
    xrpc::XrpcService,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to log in as {identifier}: {source}"))]
    Login {
        identifier: String,
        source: skydeck::remote::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Format `session` as the configuration items needed to resume it
pub fn config_snippet(session: &Session) -> String {
    let mut text = format!(
        "did = \"{}\"\ntoken = \"{}\"\n",
        session.did(),
        session.access().expose_secret()
    );
    if let Some(refresh) = session.refresh_token() {
        text.push_str(&format!("refresh-token = \"{}\"\n", refresh.expose_secret()));
    }
    text
}

/// Log in to `pds`, then print what the user needs to add to their configuration
pub async fn login<C: XrpcService>(
    client: &C,
    pds: &Url,
    identifier: &str,
    password: &SecretString,
) -> Result<()> {
    let session = session::login(client, pds, identifier, password)
        .await
        .context(LoginSnafu { identifier })?;
    println!(
        "Logged in as {} ({}). Add the following to your configuration file:\n\n{}",
        session.handle(),
        session.did(),
        config_snippet(&session)
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use skydeck_shared::Did;

    #[test]
    fn snippet_is_valid_config() {
        let session = Session::new(
            Did::new("did:plc:me").unwrap(),
            None,
            SecretString::from("a".to_owned()),
            Some(SecretString::from("r".to_owned())),
        );
        let text = format!("version = \"1\"\n{}", config_snippet(&session));
        let cfg: skydeck::config::Configuration = toml::from_str(&text).unwrap();
        assert_eq!(cfg.did().unwrap().as_ref(), "did:plc:me");
        assert_eq!(cfg.token().unwrap().expose_secret(), "a");
        assert_eq!(cfg.refresh_token().unwrap().expose_secret(), "r");

        let session = Session::new(
            Did::new("did:plc:me").unwrap(),
            None,
            SecretString::from("a".to_owned()),
            None,
        );
        assert!(!config_snippet(&session).contains("refresh-token"));
    }
}
