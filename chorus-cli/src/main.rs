//! chorus-cli: submit agent calls to a Chorus server and read back results
//!
//! # Subcommands
//! - `call <query> [--character <name>] [--session <id>] [--wallet <addr>]`: queue an agent call
//! - `request <request-id>`: show a queued call's status
//! - `history <session-id> [-n <limit>] [--json]`: print a session transcript
//! - `status`: show server health

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8780";
const DEFAULT_HISTORY_LIMIT: u32 = 50;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "chorus-cli", version, about = "Talk to the Chorus agent group chat")]
struct Cli {
    /// Chorus HTTP server URL (overrides CHORUS_HTTP_URL env var)
    #[arg(long, env = "CHORUS_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Bearer token for authenticated endpoints
    #[arg(long, env = "CHORUS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Queue a message for the agents
    Call {
        /// Message text
        query: String,

        /// Agent the message is addressed to (server default if omitted)
        #[arg(long)]
        character: Option<String>,

        /// Existing session to continue (a new one is created if omitted)
        #[arg(long)]
        session: Option<String>,

        /// Sender's wallet address
        #[arg(long)]
        wallet: Option<String>,

        #[arg(long)]
        token_address: Option<String>,

        #[arg(long)]
        chain_id: Option<u64>,
    },

    /// Show the tracking record of a queued call
    Request {
        request_id: String,
    },

    /// Print a session's messages, oldest first
    History {
        session_id: String,

        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: u32,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Show Chorus server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub request_id: String,
    pub session_id: String,
    pub status: String,
    pub message: String,
    pub estimated_processing_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub created_at: String,
    pub created_by: String,
    pub character_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub count: usize,
    pub messages: Vec<HistoryMessage>,
}

/// Query string for `GET /v1/callAgent`, skipping absent options.
pub fn call_query(
    query: &str,
    character: Option<&str>,
    session: Option<&str>,
    wallet: Option<&str>,
    token_address: Option<&str>,
    chain_id: Option<u64>,
) -> Vec<(&'static str, String)> {
    let mut params = vec![("query", query.to_string())];
    let optional = [
        ("characterId", character.map(str::to_string)),
        ("sessionId", session.map(str::to_string)),
        ("walletAddress", wallet.map(str::to_string)),
        ("tokenAddress", token_address.map(str::to_string)),
        ("chainId", chain_id.map(|c| c.to_string())),
    ];
    params.extend(optional.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))));
    params
}

/// One transcript line: `[time] author -> character: message`.
pub fn format_history_line(m: &HistoryMessage) -> String {
    // RFC 3339 timestamps; keep date and time to the second
    let when: String = m.created_at.chars().take(19).collect::<String>().replace('T', " ");
    format!("[{}] {} -> {}: {}", when, m.created_by, m.character_id, m.message)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn require_token(token: Option<&str>) -> &str {
    match token {
        Some(t) if !t.is_empty() => t,
        _ => {
            eprintln!("chorus-cli: a bearer token is required (--token or CHORUS_TOKEN)");
            std::process::exit(1);
        }
    }
}

/// Send an authenticated GET and return the JSON body, exiting on failure.
fn get_json(
    url: &str,
    token: &str,
    query: &[(&'static str, String)],
) -> anyhow::Result<serde_json::Value> {
    let resp = match client(30)?.get(url).bearer_auth(token).query(query).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("chorus-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body: serde_json::Value = resp.json().unwrap_or_default();
        let message = body["message"].as_str().unwrap_or("no details");
        match body["errorId"].as_str() {
            Some(id) => eprintln!("chorus-cli: server returned {}: {} (error id {})", status, message, id),
            None => eprintln!("chorus-cli: server returned {}: {}", status, message),
        }
        std::process::exit(1);
    }

    Ok(resp.json()?)
}

fn do_call(server: &str, token: &str, params: Vec<(&'static str, String)>) -> anyhow::Result<()> {
    let url = format!("{}/v1/callAgent", server);
    let body = get_json(&url, token, &params)?;
    let resp: CallResponse = serde_json::from_value(body)?;

    println!("{}", resp.message);
    println!("Request:  {}", resp.request_id);
    println!("Session:  {}", resp.session_id);
    println!("Status:   {}", resp.status);
    if let Some(eta) = resp.estimated_processing_time {
        println!("ETA:      {}", eta);
    }
    Ok(())
}

fn do_request(server: &str, token: &str, request_id: &str) -> anyhow::Result<()> {
    let url = format!("{}/v1/requests/{}", server, request_id);
    let body = get_json(&url, token, &[])?;

    println!("Request:  {}", body["requestId"].as_str().unwrap_or(request_id));
    println!("Session:  {}", body["sessionId"].as_str().unwrap_or("?"));
    println!("Status:   {}", body["status"].as_str().unwrap_or("?"));
    if let Some(error) = body["error"].as_str() {
        println!("Error:    {}", error);
    }
    Ok(())
}

fn do_history(server: &str, token: &str, session_id: &str, limit: u32, json: bool) -> anyhow::Result<()> {
    let url = format!("{}/v1/sessions/{}/messages", server, session_id);
    let body = get_json(&url, token, &[("limit", limit.to_string())])?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let history: HistoryResponse = serde_json::from_value(body)?;
    if history.messages.is_empty() {
        eprintln!("No messages in session {}", history.session_id);
        return Ok(());
    }
    for m in &history.messages {
        println!("{}", format_history_line(m));
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Chorus server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("Database:      {}", body["database"].as_str().unwrap_or("?"));
            println!("Queue depth:   {}", body["queueDepth"]);
            println!("Dead letters:  {}", body["deadLetters"]);
            println!("Connections:   {}", body["connections"]);
        }
        Ok(r) => {
            eprintln!("chorus-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("chorus-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();
    let token = cli.token.as_deref();

    let result = match cli.command {
        Commands::Call {
            query,
            character,
            session,
            wallet,
            token_address,
            chain_id,
        } => {
            let params = call_query(
                &query,
                character.as_deref(),
                session.as_deref(),
                wallet.as_deref(),
                token_address.as_deref(),
                chain_id,
            );
            do_call(&server, require_token(token), params)
        }
        Commands::Request { request_id } => do_request(&server, require_token(token), &request_id),
        Commands::History {
            session_id,
            limit,
            json,
        } => do_history(&server, require_token(token), &session_id, limit, json),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("chorus-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_query_skips_absent_options() {
        let params = call_query("gm", None, Some("s-1"), None, None, Some(8453));
        assert_eq!(
            params,
            vec![
                ("query", "gm".to_string()),
                ("sessionId", "s-1".to_string()),
                ("chainId", "8453".to_string()),
            ]
        );
    }

    #[test]
    fn test_call_query_minimal() {
        assert_eq!(call_query("hi", None, None, None, None, None).len(), 1);
    }

    #[test]
    fn test_history_line_format() {
        let m = HistoryMessage {
            created_at: "2026-03-01T12:00:05.123Z".to_string(),
            created_by: "Luna".to_string(),
            character_id: "Jaden".to_string(),
            message: "Hey Jaden, price?".to_string(),
        };
        assert_eq!(
            format_history_line(&m),
            "[2026-03-01 12:00:05] Luna -> Jaden: Hey Jaden, price?"
        );
    }

    #[test]
    fn test_history_response_parses_server_shape() {
        let body = serde_json::json!({
            "sessionId": "s-1",
            "count": 1,
            "messages": [{
                "PK": "s-1",
                "SK": "0000000000001#abc",
                "createdAt": "2026-03-01T12:00:05Z",
                "createdBy": "alice",
                "message": "hello",
                "ttl": 0,
                "sessionId": "s-1",
                "characterId": "Luna"
            }]
        });
        let parsed: HistoryResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.messages[0].created_by, "alice");
    }

    #[test]
    fn test_cli_parses_call() {
        let cli = Cli::try_parse_from([
            "chorus-cli", "--token", "t", "call", "gm", "--character", "Luna", "--chain-id", "1",
        ])
        .unwrap();
        assert_eq!(cli.token.as_deref(), Some("t"));
        match cli.command {
            Commands::Call { query, character, chain_id, .. } => {
                assert_eq!(query, "gm");
                assert_eq!(character.as_deref(), Some("Luna"));
                assert_eq!(chain_id, Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
