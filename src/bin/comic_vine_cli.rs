//! comic-vine CLI: fetch Comic Vine resources through the cached, rate-limited client.
//!
//! Usage:
//!   comic-vine get <resource> <id> [--fields a,b]          Retrieve one resource
//!   comic-vine list <resource> [--limit N] [--offset N]    List a resource page
//!   comic-vine status <resource>                           Show rate-limit status
//!   comic-vine fingerprint <endpoint> [<json params>]      Print a request fingerprint

use chrono::{TimeZone, Utc};
use comic_vine::client::{
    ComicVineClient, ListOptions, OrchestratorConfig, RequestOrchestrator, ResourceType,
    RetrieveOptions, SortDirection, UrlBuilder,
};
use comic_vine::rate_limit::{AdaptiveConfig, RateLimiterConfig};
use comic_vine::sqlite::{
    SqliteCacheStore, SqliteConfig, SqliteConnection, SqliteDedupeStore, SqliteRateLimitStore,
};
use comic_vine::stores::Priority;
use comic_vine::transport::HttpTransport;
use comic_vine::{Error, ErrorContext, RateLimitStore, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let outcome = match args[1].as_str() {
        "get" => cmd_get(&args[2..]).await,
        "list" => cmd_list(&args[2..]).await,
        "status" => cmd_status(&args[2..]).await,
        "fingerprint" => cmd_fingerprint(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("comic-vine {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"comic-vine: Comic Vine API command line

USAGE:
    comic-vine <COMMAND> [OPTIONS]

COMMANDS:
    get <resource> <id>              Retrieve one resource
        --fields <a,b,...>           Only return these fields
    list <resource>                  List a page of resources
        --limit <n>                  Page size (1-100)
        --offset <n>                 Start offset
        --sort <field>[:asc|desc]    Sort order
        --filter <field>:<value>     Filter, may be repeated
    status <resource>                Show rate-limit status for a resource
    fingerprint <endpoint> [json]    Print the request fingerprint
    version                          Show version information
    help                             Show this help message

GLOBAL OPTIONS:
    --background                     Send as background traffic

ENVIRONMENT:
    COMIC_VINE_API_KEY               API key (required for get/list)
    COMIC_VINE_CACHE_PATH            SQLite database (default: comic-vine.db)
    COMIC_VINE_BASE_URL              Override the API base URL
    RUST_LOG                         Log filter (default: info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn flags<'a>(args: &'a [String], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    args.windows(2)
        .filter(move |pair| pair[0] == name)
        .map(|pair| pair[1].as_str())
}

fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
        } else if arg == "--background" {
            continue;
        } else if arg.starts_with("--") {
            skip = true;
        } else {
            out.push(arg.as_str());
        }
    }
    out
}

fn invalid(message: String) -> Error {
    Error::validation_with_context(message, ErrorContext::new().with_source("cli"))
}

fn parse_number(value: &str, what: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| invalid(format!("{what} must be a number, got '{value}'")))
}

fn usage_error(message: &str) -> Error {
    invalid(format!("{message} (see `comic-vine help`)"))
}

/// SQLite-backed stores sharing one connection, plus the client on top.
struct Session {
    client: ComicVineClient,
    rate_limiter: Arc<SqliteRateLimitStore>,
    conn: SqliteConnection,
}

impl Session {
    fn open(args: &[String]) -> Result<Self> {
        let background = args.iter().any(|a| a == "--background");
        let path = std::env::var("COMIC_VINE_CACHE_PATH").unwrap_or_else(|_| "comic-vine.db".into());
        let config = SqliteConfig::new(path);
        let conn = SqliteConnection::open(&config)?;

        let mut limits = RateLimiterConfig::new();
        if background {
            limits = limits.with_adaptive(AdaptiveConfig::default());
        }
        let rate_limiter = Arc::new(SqliteRateLimitStore::sqlite(conn.clone(), false, limits));

        let api_key = std::env::var("COMIC_VINE_API_KEY").unwrap_or_default();
        let urls = match std::env::var("COMIC_VINE_BASE_URL") {
            Ok(base) => UrlBuilder::with_base_url(&base, api_key)?,
            Err(_) => UrlBuilder::new(api_key)?,
        };

        let orchestrator = RequestOrchestrator::builder()
            .cache(Arc::new(SqliteCacheStore::with_connection(
                conn.clone(),
                config.clone(),
            )?))
            .dedupe(Arc::new(SqliteDedupeStore::with_connection(
                conn.clone(),
                config,
            )?))
            .rate_limiter(rate_limiter.clone())
            .config(OrchestratorConfig::from_env())
            .build(Arc::new(HttpTransport::from_env()?), urls);

        let priority = if background {
            Priority::Background
        } else {
            Priority::User
        };
        Ok(Self {
            client: ComicVineClient::new(orchestrator).with_priority(priority),
            rate_limiter,
            conn,
        })
    }

    async fn close(self) -> Result<()> {
        let closed = self.client.orchestrator().close().await;
        self.conn.close();
        closed
    }
}

fn require_api_key() -> Result<()> {
    match std::env::var("COMIC_VINE_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Ok(()),
        _ => Err(Error::configuration_with_context(
            "COMIC_VINE_API_KEY is not set",
            ErrorContext::new().with_field_path("COMIC_VINE_API_KEY"),
        )),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_get(args: &[String]) -> Result<()> {
    let pos = positional(args);
    let (Some(resource), Some(id)) = (pos.first(), pos.get(1)) else {
        return Err(usage_error("usage: get <resource> <id>"));
    };
    let resource: ResourceType = resource.parse()?;
    let id = id
        .parse::<u64>()
        .map_err(|_| invalid(format!("id must be a number, got '{id}'")))?;
    require_api_key()?;

    let mut options = RetrieveOptions::new();
    if let Some(fields) = flag(args, "--fields") {
        options = options.with_fields(fields.split(',').map(str::trim));
    }

    let session = Session::open(args)?;
    let result = session
        .client
        .retrieve::<Value>(resource, id, &options)
        .await;
    let printed = result.and_then(|page| print_json(&page.results));
    session.close().await?;
    printed
}

async fn cmd_list(args: &[String]) -> Result<()> {
    let pos = positional(args);
    let Some(resource) = pos.first() else {
        return Err(usage_error("usage: list <resource>"));
    };
    let resource: ResourceType = resource.parse()?;
    require_api_key()?;

    let mut options = ListOptions::new();
    if let Some(limit) = flag(args, "--limit") {
        options = options.with_limit(parse_number(limit, "--limit")?);
    }
    if let Some(offset) = flag(args, "--offset") {
        options = options.with_offset(parse_number(offset, "--offset")?);
    }
    if let Some(sort) = flag(args, "--sort") {
        let (field, direction) = match sort.split_once(':') {
            Some((field, "desc")) => (field, SortDirection::Desc),
            Some((field, _)) => (field, SortDirection::Asc),
            None => (sort, SortDirection::Asc),
        };
        options = options.sort_by(field, direction);
    }
    for filter in flags(args, "--filter") {
        let Some((field, value)) = filter.split_once(':') else {
            return Err(usage_error("--filter expects <field>:<value>"));
        };
        options = options.filter(field, value);
    }

    let session = Session::open(args)?;
    let result = session.client.list::<Value>(resource, &options).await;
    let printed = result.and_then(|page| {
        eprintln!(
            "{} {}-{} of {}",
            resource.list_name(),
            page.offset,
            page.offset + page.number_of_page_results,
            page.number_of_total_results
        );
        print_json(&page.results)
    });
    session.close().await?;
    printed
}

async fn cmd_status(args: &[String]) -> Result<()> {
    let pos = positional(args);
    let Some(resource) = pos.first() else {
        return Err(usage_error("usage: status <resource>"));
    };
    let resource: ResourceType = resource.parse()?;

    let session = Session::open(args)?;
    let status = session.rate_limiter.status(resource.list_name()).await;
    let printed = status.map(|status| {
        let reset = Utc
            .timestamp_millis_opt(status.reset_at_ms)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| status.reset_at_ms.to_string());
        println!("resource:  {}", resource.list_name());
        println!("remaining: {}/{}", status.remaining, status.limit);
        println!("reset at:  {reset}");
        if let Some(adaptive) = &status.adaptive {
            println!(
                "adaptive:  user {}/{} background {}/{} ({})",
                adaptive.user_count,
                adaptive.capacity.user_reserved,
                adaptive.background_count,
                adaptive.capacity.background_max,
                adaptive.capacity.reason
            );
        }
    });
    session.close().await?;
    printed
}

fn cmd_fingerprint(args: &[String]) -> Result<()> {
    let Some(endpoint) = args.first() else {
        return Err(usage_error("usage: fingerprint <endpoint> [json params]"));
    };
    let params: Value = match args.get(1) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Object(Default::default()),
    };
    println!("{}", comic_vine::fingerprint(endpoint, &params));
    Ok(())
}
