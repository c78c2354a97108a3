//! Duplex CLI - issue tokens and run handshakes from the command line.

mod ws;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use duplex_core::{IdentityClaims, Secret, SessionClaims, token};
use duplex_handshake::{
    Authority, AuthorityConfig, Event, HandshakeError, Initiator, InitiatorConfig, MemoryNetwork,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use ws::WsConnector;

/// Duplex handshake CLI
#[derive(Parser)]
#[command(name = "duplex")]
#[command(about = "Two-phase token handshake for full-duplex channels", long_about = None)]
struct Cli {
    /// Path to the saved token file (default: platform config dir)
    #[arg(short, long, global = true)]
    token_file: Option<PathBuf>,

    /// Shared secret used to sign and verify tokens
    #[arg(long, global = true, env = "SECRET_KEY", hide_env_values = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identity token management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Handshake testing
    Handshake {
        #[command(subcommand)]
        action: HandshakeAction,
    },
    /// Run both phases against a gateway and open a data channel
    Connect {
        /// Gateway websocket url
        #[arg(long, default_value = "ws://127.0.0.1:8700/ws")]
        url: String,
        /// Identity token (default: the saved token)
        #[arg(long)]
        token: Option<String>,
        /// Messages to send once connected
        #[arg(short, long)]
        message: Vec<String>,
        /// Seconds to keep listening for messages (default: until Ctrl-C)
        #[arg(long)]
        listen_secs: Option<u64>,
        /// Polls before the request times out
        #[arg(long, default_value_t = 10)]
        attempts: u32,
        /// Milliseconds between polls
        #[arg(long, default_value_t = 100,
              value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: u64,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue an identity token
    Issue {
        /// User id the token identifies
        #[arg(long)]
        uid: String,
        /// Lifetime in minutes (default: no expiry)
        #[arg(long)]
        ttl: Option<i64>,
        /// Save the token for later commands
        #[arg(long)]
        save: bool,
        /// Overwrite an existing saved token
        #[arg(short, long)]
        force: bool,
    },
    /// Decode a token, verifying it when a secret is available
    Inspect {
        /// Token to inspect (default: the saved token)
        token: Option<String>,
    },
}

#[derive(Subcommand)]
enum HandshakeAction {
    /// Run both phases in-process
    Test {
        /// User id to run the handshake for
        #[arg(long, default_value = "local")]
        uid: String,
    },
}

/// Saved token file format.
#[derive(Serialize, Deserialize)]
struct StoredToken {
    uid: String,
    token: String,
    created_at: String,
}

fn get_token_path(cli_path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = cli_path {
        return Ok(path);
    }

    let proj_dirs = directories::ProjectDirs::from("rs", "duplex", "duplex")
        .context("Could not determine config directory")?;

    Ok(proj_dirs.config_dir().join("token.json"))
}

fn require_secret(secret: Option<String>) -> Result<Secret> {
    match secret {
        Some(secret) if !secret.is_empty() => Ok(Secret::from(secret)),
        _ => bail!("A secret is required: pass --secret or set SECRET_KEY"),
    }
}

fn load_token(path: &Path) -> Result<StoredToken> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read token file: {}", path.display()))?;

    let stored: StoredToken =
        serde_json::from_str(&contents).context("Invalid token file format")?;

    let claims: IdentityClaims = token::decode(&stored.token).context("Saved token is malformed")?;
    if claims.uid != stored.uid {
        bail!("Token file corrupted: uid mismatch");
    }

    Ok(stored)
}

fn save_token(path: &Path, uid: &str, token: &str) -> Result<()> {
    let stored = StoredToken {
        uid: uid.to_string(),
        token: token.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    let contents = serde_json::to_string_pretty(&stored)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, contents)?;

    // Tokens are bearer credentials
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn resolve_token(path: &Path, token: Option<String>) -> Result<String> {
    match token {
        Some(token) => Ok(token),
        None => Ok(load_token(path)?.token),
    }
}

fn cmd_token_issue(
    path: &Path,
    secret: Secret,
    uid: String,
    ttl: Option<i64>,
    save: bool,
    force: bool,
) -> Result<()> {
    if save && path.exists() && !force {
        bail!(
            "A token is already saved at {}. Use --force to overwrite.",
            path.display()
        );
    }

    let mut claims = IdentityClaims::new(uid.as_str());
    if let Some(minutes) = ttl {
        if minutes <= 0 {
            bail!("--ttl must be positive");
        }
        claims = claims.expires_in(chrono::Duration::minutes(minutes));
    }
    let token = claims.sign(&secret)?;

    if save {
        save_token(path, &uid, &token)?;
        eprintln!("Saved to: {}", path.display());
    }
    println!("{}", token);

    Ok(())
}

fn cmd_token_inspect(path: &Path, secret: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(path, token)?;

    // Session keys carry originalToken; try them first.
    let payload = match token::decode::<SessionClaims>(&token) {
        Ok(session) => serde_json::to_value(&session)?,
        Err(_) => serde_json::to_value(token::decode::<IdentityClaims>(&token)?)?,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    match secret.filter(|secret| !secret.is_empty()) {
        Some(secret) => match token::verify::<serde_json::Value>(&token, &Secret::from(secret)) {
            Ok(_) => println!("✓ Signature valid"),
            Err(e) => println!("✗ {}", e),
        },
        None => println!("(not verified: no secret)"),
    }

    Ok(())
}

async fn cmd_handshake_test(secret: Option<String>, uid: String) -> Result<()> {
    let secret = match secret.filter(|secret| !secret.is_empty()) {
        Some(secret) => Secret::from(secret),
        None => Secret::generate(),
    };

    let network = MemoryNetwork::new();
    let authority = Arc::new(Authority::new(AuthorityConfig::new(secret.clone())));
    tokio::spawn(Arc::clone(&authority).serve(network.listen("mem://local")));

    println!("Testing handshake...");
    println!("  uid: {}", uid);
    println!();

    let token = IdentityClaims::new(uid.as_str()).sign(&secret)?;
    let client = Initiator::new(network, InitiatorConfig::new("mem://local"), token)?;
    println!("1. Issued identity token");

    let response = client.request_connection().await?;
    if response.timed_out {
        bail!("Request timed out");
    }
    let pending = authority
        .pending(&uid)
        .context("Authority recorded no pending connection")?;
    println!(
        "2. Request verified (pending until {})",
        pending.expires_at.to_rfc3339()
    );

    let key = client.session_key().context("No session key stored")?;
    println!("3. Received session key ({}...)", &key[..key.len().min(16)]);

    client.connect().await?;
    for _ in 0..100 {
        if authority.open(&uid).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if authority.open(&uid).is_none() {
        bail!("Data channel was not promoted");
    }
    println!("4. Data channel open");

    let delivered = authority.broadcast("hello");
    println!("5. Broadcast delivered to {} connection(s)", delivered);

    client.close()?;
    println!();
    println!("✓ Handshake successful!");

    Ok(())
}

async fn cmd_connect(
    path: &Path,
    url: String,
    token: Option<String>,
    messages: Vec<String>,
    listen_secs: Option<u64>,
    attempts: u32,
    interval_ms: u64,
) -> Result<()> {
    let token = resolve_token(path, token)?;
    let config = InitiatorConfig::new(url.as_str())
        .with_retry(RetryPolicy::new(attempts, Duration::from_millis(interval_ms)));
    let client = Initiator::new(WsConnector, config, token)?;

    println!("Requesting connection for {} at {}", client.uid(), url);
    let response = match client.request_connection().await {
        Ok(response) => response,
        Err(HandshakeError::Rejected { code, reason }) => {
            bail!("Rejected ({}): {}", code, reason)
        }
        Err(e) => return Err(e).context("Request failed"),
    };
    if response.timed_out {
        bail!("No reply from {} before timeout", url);
    }

    client
        .register_event("message", |event: &Event| {
            println!("< {}", event.payload.as_deref().unwrap_or_default());
        })
        .context("Could not register message handler")?;
    client.connect().await.context("Data channel failed")?;
    println!("Connected");

    for message in messages {
        client.send(message.as_str())?;
        println!("> {}", message);
    }

    match listen_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    client.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let token_path = get_token_path(cli.token_file)?;

    match cli.command {
        Commands::Token { action } => match action {
            TokenAction::Issue {
                uid,
                ttl,
                save,
                force,
            } => cmd_token_issue(&token_path, require_secret(cli.secret)?, uid, ttl, save, force),
            TokenAction::Inspect { token } => cmd_token_inspect(&token_path, cli.secret, token),
        },
        Commands::Handshake { action } => match action {
            HandshakeAction::Test { uid } => cmd_handshake_test(cli.secret, uid).await,
        },
        Commands::Connect {
            url,
            token,
            message,
            listen_secs,
            attempts,
            interval_ms,
        } => {
            cmd_connect(
                &token_path,
                url,
                token,
                message,
                listen_secs,
                attempts,
                interval_ms,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("duplex-cli-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_save_and_load_token() {
        let path = temp_path("roundtrip");
        let token = IdentityClaims::new("u1").sign(&Secret::from("s")).unwrap();

        save_token(&path, "u1", &token).unwrap();
        let stored = load_token(&path).unwrap();
        assert_eq!(stored.uid, "u1");
        assert_eq!(stored.token, token);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_detects_uid_mismatch() {
        let path = temp_path("mismatch");
        let token = IdentityClaims::new("u1").sign(&Secret::from("s")).unwrap();
        save_token(&path, "u2", &token).unwrap();

        assert!(load_token(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_issue_refuses_overwrite() {
        let path = temp_path("overwrite");
        cmd_token_issue(&path, Secret::from("s"), "u1".into(), None, true, false).unwrap();
        assert!(cmd_token_issue(&path, Secret::from("s"), "u1".into(), None, true, false).is_err());
        cmd_token_issue(&path, Secret::from("s"), "u2".into(), Some(5), true, true).unwrap();
        assert_eq!(load_token(&path).unwrap().uid, "u2");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_secret_required() {
        assert!(require_secret(None).is_err());
        assert!(require_secret(Some(String::new())).is_err());
        assert!(require_secret(Some("s".into())).is_ok());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["duplex", "token", "issue", "--uid", "u1", "--save"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Token {
                action: TokenAction::Issue { save: true, .. }
            }
        ));

        let cli = Cli::try_parse_from(["duplex", "connect", "-m", "a", "-m", "b"]).unwrap();
        match cli.command {
            Commands::Connect { message, url, .. } => {
                assert_eq!(message, vec!["a", "b"]);
                assert_eq!(url, "ws://127.0.0.1:8700/ws");
            }
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Cli::try_parse_from(["duplex", "connect", "--interval-ms", "0"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_local_handshake() {
        cmd_handshake_test(Some("cli-test".into()), "u1".into())
            .await
            .unwrap();
    }
}
