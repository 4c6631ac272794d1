//! `mailweave` - decode, compose and fetch web mail from the command line.
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`; command output
//! goes to stdout.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mailweave_core::{GmailProvider, MailSession, SessionConfig, StaticToken};
use mailweave_mime::{
    ComposeAttachment, ComposeRequest, Composer, Mailbox, ProviderMessage, parse_email, parse_raw,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the access token.
const TOKEN_ENV: &str = "MAILWEAVE_TOKEN";

type Session = MailSession<GmailProvider<StaticToken>>;

#[derive(Parser, Debug)]
#[command(name = "mailweave", version)]
#[command(about = "Decode, compose and fetch web mail")]
struct Cli {
    /// Session configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a raw .eml file or a provider message .json file
    Decode {
        /// Message file
        file: PathBuf,
    },
    /// Build a MIME message from an HTML body and attachments
    Compose(ComposeArgs),
    /// List message ids matching a search query
    List {
        /// Provider search query
        #[arg(short, long, default_value = "")]
        query: String,
        /// Page size (0 uses the configured default)
        #[arg(short = 'n', long, default_value_t = 0)]
        page_size: u32,
        /// Token of the page to fetch
        #[arg(long)]
        page_token: Option<String>,
        #[command(flatten)]
        auth: AuthArgs,
    },
    /// Fetch and decode messages
    Fetch {
        /// Message ids
        #[arg(required = true)]
        ids: Vec<String>,
        /// Also fetch inline images as data URLs
        #[arg(long)]
        inline_images: bool,
        #[command(flatten)]
        auth: AuthArgs,
    },
}

#[derive(Args, Debug)]
struct AuthArgs {
    /// Access token (defaults to $MAILWEAVE_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// API root to use instead of Gmail's
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Args, Debug)]
struct ComposeArgs {
    /// Sender address
    #[arg(long)]
    from: Option<String>,

    /// Recipient address (repeatable)
    #[arg(long, required = true)]
    to: Vec<String>,

    /// Carbon-copy address (repeatable)
    #[arg(long)]
    cc: Vec<String>,

    /// Blind carbon-copy address (repeatable)
    #[arg(long)]
    bcc: Vec<String>,

    /// Subject line
    #[arg(short, long, default_value = "")]
    subject: String,

    /// File holding the HTML body
    #[arg(long)]
    html: PathBuf,

    /// File to attach (repeatable)
    #[arg(long)]
    attach: Vec<PathBuf>,

    /// Inline image, referenced from the body as `cid:<file name>` (repeatable)
    #[arg(long)]
    inline: Vec<PathBuf>,

    /// Message-ID this message replies to
    #[arg(long)]
    in_reply_to: Option<String>,

    /// Print the base64url transport form instead of the raw message
    #[arg(long)]
    encoded: bool,

    /// Send the message instead of printing it
    #[arg(long)]
    send: bool,

    /// Thread to send into
    #[arg(long, requires = "send")]
    thread_id: Option<String>,

    #[command(flatten)]
    auth: AuthArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailweave=info,mailweave_core=info,mailweave_mime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Command::Decode { file } => decode(&file, &config).await,
        Command::Compose(args) => compose(args, &config).await,
        Command::List {
            query,
            page_size,
            page_token,
            auth,
        } => {
            let session = connect(&auth, &config)?;
            let page = session
                .list_messages(&query, page_size, page_token.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        Command::Fetch {
            ids,
            inline_images,
            auth,
        } => fetch(&ids, inline_images, &auth, &config).await,
    }
}

/// Load the session configuration.
///
/// An explicit path must exist. Otherwise the per-user config file is used
/// when present, and the defaults when it is not.
async fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    if let Some(path) = path {
        return SessionConfig::load(path)
            .await
            .with_context(|| format!("loading config {}", path.display()));
    }

    let default_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailweave")
        .join("config.json");

    if !default_path.exists() {
        return Ok(SessionConfig::default());
    }

    SessionConfig::load(&default_path)
        .await
        .with_context(|| format!("loading config {}", default_path.display()))
}

fn connect(auth: &AuthArgs, config: &SessionConfig) -> Result<Session> {
    let token = match &auth.token {
        Some(token) => token.clone(),
        None => std::env::var(TOKEN_ENV)
            .with_context(|| format!("no access token: pass --token or set {TOKEN_ENV}"))?,
    };

    let mut provider = GmailProvider::new(StaticToken::new(token));
    if let Some(base_url) = &auth.base_url {
        provider = provider.with_base_url(base_url.clone());
    }
    Ok(MailSession::new(provider, config.clone()))
}

async fn decode(file: &Path, config: &SessionConfig) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let message = if is_json(file) {
        ProviderMessage::from_json(&String::from_utf8_lossy(&bytes))?
    } else {
        let id = file
            .file_stem()
            .map_or_else(|| "local".to_string(), |stem| stem.to_string_lossy().into_owned());
        parse_raw(&bytes)?.to_provider_message(id)
    };

    let email = parse_email(&message, &config.decode)?;
    info!(
        id = %email.id,
        attachments = email.attachments.len(),
        inline = email.inline_attachments.len(),
        "decoded message"
    );
    println!("{}", serde_json::to_string_pretty(&email)?);
    Ok(())
}

async fn compose(args: ComposeArgs, config: &SessionConfig) -> Result<()> {
    let html = tokio::fs::read_to_string(&args.html)
        .await
        .with_context(|| format!("reading {}", args.html.display()))?;

    let mut request = ComposeRequest::new(args.subject, html);
    if let Some(from) = &args.from {
        request = request.from(mailbox(from)?);
    }
    for address in &args.to {
        request = request.to(mailbox(address)?);
    }
    for address in &args.cc {
        request = request.cc(mailbox(address)?);
    }
    for address in &args.bcc {
        request = request.bcc(mailbox(address)?);
    }
    for path in &args.attach {
        request = request.attach(attachment(path).await?);
    }
    for path in &args.inline {
        let image = attachment(path).await?;
        let cid = image.name.clone();
        request = request.attach(image.with_cid(cid));
    }
    if let Some(message_id) = args.in_reply_to {
        request = request.in_reply_to(message_id);
    }

    if args.send {
        let session = connect(&args.auth, config)?;
        let sent = session.send(&request, args.thread_id.as_deref()).await?;
        println!("{}", serde_json::to_string_pretty(&sent)?);
        return Ok(());
    }

    let composed = Composer::new(config.compose_domain.clone()).compose(&request)?;
    info!(
        message_id = %composed.message_id,
        multiparts = composed.boundaries.len(),
        "composed message"
    );
    if args.encoded {
        println!("{}", composed.encoded);
    } else {
        print!("{}", composed.raw);
    }
    Ok(())
}

async fn fetch(
    ids: &[String],
    inline_images: bool,
    auth: &AuthArgs,
    config: &SessionConfig,
) -> Result<()> {
    let session = connect(auth, config)?;
    let results = session.fetch_messages(ids).await;

    let mut output = Vec::new();
    let mut failed = 0;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(email) => {
                let images = if inline_images {
                    session.resolve_inline_images(&email).await
                } else {
                    HashMap::new()
                };
                output.push(serde_json::json!({ "email": email, "inlineImages": images }));
            }
            Err(error) => {
                failed += 1;
                tracing::error!(%id, %error, "fetch failed");
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    let stats = session.stats();
    info!(
        completed = stats.completed,
        retried = stats.retried,
        failed = stats.failed,
        "fetch finished"
    );
    if failed > 0 {
        bail!("{failed} of {} messages failed", ids.len());
    }
    Ok(())
}

fn mailbox(address: &str) -> Result<Mailbox> {
    Mailbox::parse(address)
        .filter(|mailbox| mailbox.email.contains('@'))
        .with_context(|| format!("invalid address: {address}"))
}

async fn attachment(path: &Path) -> Result<ComposeAttachment> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(ComposeAttachment::from_bytes(name, mime_type_for(path), &bytes))
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Guess a MIME type from the file extension.
fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        "ics" => "text/calendar",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("logo.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("report.pdf")), "application/pdf");
        assert_eq!(mime_type_for(Path::new("Makefile")), "application/octet-stream");
    }

    #[test]
    fn test_parse_compose_args() {
        let cli = Cli::try_parse_from([
            "mailweave",
            "compose",
            "--to",
            "bob@example.com",
            "--to",
            "Carol <carol@example.com>",
            "--html",
            "body.html",
            "--attach",
            "a.pdf",
            "--encoded",
        ])
        .unwrap();

        let Command::Compose(args) = cli.command else {
            panic!("expected compose");
        };
        assert_eq!(args.to.len(), 2);
        assert_eq!(args.attach, vec![PathBuf::from("a.pdf")]);
        assert!(args.encoded);
        assert!(!args.send);
    }

    #[test]
    fn test_thread_id_requires_send() {
        let result = Cli::try_parse_from([
            "mailweave",
            "compose",
            "--to",
            "bob@example.com",
            "--html",
            "body.html",
            "--thread-id",
            "t1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_fetch_with_config() {
        let cli =
            Cli::try_parse_from(["mailweave", "fetch", "m1", "m2", "--config", "cfg.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("cfg.json")));
        let Command::Fetch { ids, inline_images, .. } = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(ids, vec!["m1".to_string(), "m2".to_string()]);
        assert!(!inline_images);
    }

    #[test]
    fn test_mailbox_parse() {
        let parsed = mailbox("Carol <carol@example.com>").unwrap();
        assert_eq!(parsed.email, "carol@example.com");
        assert!(mailbox("not an address").is_err());
    }
}
