//! Link subcommands: encode, decode.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::Write;

use ssrelay_core::model::DEFAULT_CIPHER;
use ssrelay_core::{Endpoint, RelayCredential, RelayLink, link};

/// Link subcommand actions.
#[derive(clap::Subcommand, Debug)]
pub enum LinkAction {
    /// Build an ss:// link from its parts.
    Encode {
        /// Server host or IP address.
        #[arg(long)]
        host: String,
        /// Server port.
        #[arg(long)]
        port: u16,
        /// Shared secret.
        #[arg(long)]
        secret: String,
        /// Cipher method.
        #[arg(long, default_value = DEFAULT_CIPHER)]
        method: String,
        /// Display name carried after `#`.
        #[arg(long, default_value = "")]
        label: String,
    },
    /// Print the parts of an ss:// link.
    Decode {
        /// Link to decode.
        link: String,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

/// Execute a link subcommand.
pub fn run(action: LinkAction, out: &mut impl Write) -> anyhow::Result<()> {
    match action {
        LinkAction::Encode {
            host,
            port,
            secret,
            method,
            label,
        } => encode(out, host, port, &secret, &method, &label),
        LinkAction::Decode { link, json } => decode(out, &link, json),
    }
}

fn encode(
    out: &mut impl Write,
    host: String,
    port: u16,
    secret: &str,
    method: &str,
    label: &str,
) -> anyhow::Result<()> {
    if secret.is_empty() {
        anyhow::bail!("secret must not be empty");
    }
    let endpoint = Endpoint::new(host, port);
    endpoint.validate()?;
    let credential = RelayCredential::new(method, secret);
    writeln!(out, "{}", link::encode(&credential, &endpoint, label))?;
    Ok(())
}

fn decode(out: &mut impl Write, raw: &str, json: bool) -> anyhow::Result<()> {
    let decoded: RelayLink = link::decode(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid link ({}): {e}", e.code()))?;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&decoded)?)?;
        return Ok(());
    }
    writeln!(out, "Method: {}", decoded.credential.method)?;
    writeln!(out, "Secret: {}", decoded.credential.secret)?;
    writeln!(out, "Host:   {}", decoded.endpoint.host)?;
    writeln!(out, "Port:   {}", decoded.endpoint.port)?;
    if !decoded.label.is_empty() {
        writeln!(out, "Label:  {}", decoded.label)?;
    }
    Ok(())
}
