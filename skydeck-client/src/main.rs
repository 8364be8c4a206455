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

//! # skyc
//!
//! [skyc](crate) ("sky-c") is a small command-line client built on [skydeck]: log in, read your
//! timeline, and like or repost posts. It's mostly a way to exercise the library against a real
//! PDS.

use std::{path::PathBuf, result::Result as StdResult, sync::Arc};

use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use rpassword::prompt_password;
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tap::Pipe;
use tracing::Level;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use url::Url;

use skydeck::{
    config::Configuration,
    feed::{FeedAssembler, Invalidation},
    interaction::InteractionController,
    session::Session,
    shadow::ShadowStore,
    xrpc::{ClientService, XrpcClient, make_client},
};
use skydeck_shared::{AtUri, Did, EngagementKind};

use skydeck_client::{engage::engage, login::config_snippet, login::login, timeline::timeline};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to build the HTTP client: {source}"))]
    Client { source: skydeck::xrpc::Error },
    #[snafu(display("{source}"))]
    Config { source: skydeck::config::Error },
    #[snafu(display("{source}"))]
    Engage {
        source: skydeck_client::engage::Error,
    },
    #[snafu(display("{source}"))]
    Login {
        source: skydeck_client::login::Error,
    },
    #[snafu(display(
        "Missing DID; specify it with the --did option or in your configuration file"
    ))]
    NoDid,
    #[snafu(display(
        "Missing identifier; give it on the command line or set `identifier` in your configuration file"
    ))]
    NoIdentifier,
    #[snafu(display("The PDS must be specified, either in config or on the command line"))]
    NoPds,
    #[snafu(display("No sub-command given; try --help"))]
    NoSubCommand,
    #[snafu(display(
        "Missing token; run `skyc login`, then specify it with the --token option or in your configuration file"
    ))]
    NoToken,
    #[snafu(display("While prompting for a password, {source}"))]
    Password {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to setup the tracing global subscriber: {source}"))]
    Subscriber {
        source: tracing::dispatcher::SetGlobalDefaultError,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Timeline {
        source: skydeck_client::timeline::Error,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> StdResult<(), std::fmt::Error> {
        write!(f, "{self}")
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           utilities                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn default_config_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".skyc.toml")
}

/// Build an authenticated client from the configured session
fn session_client(cfg: &Configuration, client: ClientService) -> Result<XrpcClient<ClientService>> {
    let session = Session::new(
        cfg.did().context(NoDidSnafu)?.clone(),
        None,
        cfg.token().context(NoTokenSnafu)?.clone(),
        cfg.refresh_token().cloned(),
    );
    XrpcClient::new(
        client,
        cfg.pds().context(NoPdsSnafu)?.clone(),
        session,
        cfg.page_size(),
    )
    .pipe(Ok)
}

/// If the session was refreshed along the way, the configured tokens are dead; say so
async fn report_refresh(cfg: &Configuration, xrpc: &XrpcClient<ClientService>) {
    let session = xrpc.session().await;
    let stale = cfg
        .token()
        .map(|token| token.expose_secret() != session.access().expose_secret())
        .unwrap_or(false);
    if stale {
        println!(
            "\nThe session was refreshed; update your configuration file with:\n\n{}",
            config_snippet(&session)
        );
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              main                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("skyc")
        .version(crate_version!())
        .author(crate_authors!())
        .about("A small skydeck client")
        .long_about(
            "A small command-line client for Bluesky & the AT Protocol.

skyc can log you in to your PDS, page through your timeline, and like or repost
posts. Likes & reposts are applied optimistically, and rolled back if the PDS
refuses them.",
        )
        // Items that change often go on the command line (with an environment variable backup);
        // everything else lives in the configuration file.
        .arg(
            Arg::new("pds")
                .short('P')
                .long("pds")
                .num_args(1)
                .value_parser(value_parser!(Url))
                .env("SKYC_PDS")
                .global(true)
                .help("The viewer's Personal Data Server, e.g. https://bsky.social"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("SKYC_CONFIG")
                .global(true)
                .help("Specify the path to the configuration file (default ~/.skyc.toml)"),
        )
        .arg(
            Arg::new("no-default-config")
                .short('C')
                .long("no-default-config")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Don't look for a configuration file at the default location"),
        )
        .arg(
            Arg::new("token")
                .short('t')
                .long("token")
                .num_args(1)
                .value_parser(value_parser!(SecretString))
                .env("SKYC_TOKEN")
                .global(true)
                .help("The access token to be used for authentication"),
        )
        .arg(
            Arg::new("did")
                .short('d')
                .long("did")
                .num_args(1)
                .value_parser(value_parser!(Did))
                .env("SKYC_DID")
                .global(true)
                .help("The viewer's DID"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .global(true)
                .help("produce more prolix output"),
        )
        .subcommand(
            Command::new("login")
                .about("Log in to your PDS")
                .long_about(
                    "Log in to your PDS.

On success, prints the DID & tokens to add to your configuration file. Use an app
password, not your account password.",
                )
                .arg(
                    Arg::new("IDENTIFIER")
                        .required(false)
                        .index(1)
                        .help("Your handle or DID (defaults to `identifier` in config)"),
                ),
        )
        .subcommand(
            Command::new("timeline")
                .about("Print your timeline")
                .arg(
                    Arg::new("pages")
                        .short('n')
                        .long("pages")
                        .num_args(1)
                        .value_parser(value_parser!(usize))
                        .default_value("1")
                        .help("Number of pages to fetch"),
                ),
        )
        .subcommand(
            Command::new("like")
                .about("Like a post, or un-like it if you already do")
                .arg(
                    Arg::new("URI")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(AtUri))
                        .help("The AT-URI of the post"),
                ),
        )
        .subcommand(
            Command::new("repost")
                .about("Repost a post, or un-repost it if you already have")
                .arg(
                    Arg::new("URI")
                        .required(true)
                        .index(1)
                        .value_parser(value_parser!(AtUri))
                        .help("The AT-URI of the post"),
                ),
        )
        .get_matches();

    tracing::subscriber::set_global_default(
        Registry::default()
            .with(
                EnvFilter::builder()
                    .with_default_directive(if matches.get_flag("verbose") {
                        Level::DEBUG.into()
                    } else {
                        Level::INFO.into()
                    })
                    .from_env_lossy()
                    .add_directive("hyper_util=info".parse().unwrap(/* known good */))
                    .add_directive("tower=info".parse().unwrap(/* known good */)),
            )
            .with(
                fmt::Layer::default()
                    .compact()
                    .without_time()
                    .with_level(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_target(false),
            ),
    )
    .context(SubscriberSnafu)?;

    let cfg = if matches.get_flag("no-default-config") {
        Configuration::default()
    } else {
        let read = match matches.get_one::<PathBuf>("config") {
            Some(path) => Configuration::read(path, false),
            None => Configuration::read(&default_config_path(), true),
        };
        read.context(ConfigSnafu)?
    }
    .set_pds(matches.get_one::<Url>("pds"))
    .set_token(matches.get_one::<SecretString>("token"))
    .set_did(matches.get_one::<Did>("did"));

    let client = make_client(
        &format!("skyc/{} ( sp1ff@pobox.com )", crate_version!()),
        cfg.rate_limit(),
        cfg.backoff(),
    )
    .context(ClientSnafu)?;

    match matches.subcommand() {
        Some(("login", matches)) => {
            let identifier = matches
                .get_one::<String>("IDENTIFIER")
                .map(String::as_str)
                .or(cfg.identifier())
                .context(NoIdentifierSnafu)?;
            let password: SecretString = prompt_password(format!("Password for {identifier}: "))
                .context(PasswordSnafu)?
                .into();
            login(
                &client,
                cfg.pds().context(NoPdsSnafu)?,
                identifier,
                &password,
            )
            .await
            .context(LoginSnafu)
        }
        Some(("timeline", matches)) => {
            let xrpc = Arc::new(session_client(&cfg, client)?);
            let store = ShadowStore::new(cfg.shadow_capacity());
            let mut feed = FeedAssembler::new(xrpc.clone(), store, &Invalidation::new());
            let result = timeline(
                &mut feed,
                *matches.get_one::<usize>("pages").unwrap(/* known good */),
            )
            .await
            .context(TimelineSnafu);
            report_refresh(&cfg, &xrpc).await;
            result
        }
        Some((name @ ("like" | "repost"), matches)) => {
            let kind = if name == "like" {
                EngagementKind::Like
            } else {
                EngagementKind::Repost
            };
            let xrpc = Arc::new(session_client(&cfg, client)?);
            let controller = InteractionController::new(
                ShadowStore::new(cfg.shadow_capacity()),
                xrpc.clone(),
                Invalidation::new(),
            );
            let result = engage(
                &*xrpc,
                &controller,
                kind,
                matches.get_one::<AtUri>("URI").unwrap(/* impossible */),
            )
            .await
            .map(|_| ())
            .context(EngageSnafu);
            report_refresh(&cfg, &xrpc).await;
            result
        }
        Some(_) => unimplemented!(/* impossible */),
        None => NoSubCommandSnafu.fail(),
    }
}
