use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use mrt_api::{Request, Response, StateView};
use tabled::{Table, Tabled};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "mrtctl")]
#[command(about = "CLI for the mrtd multicast forwarding daemon", long_about = None)]
struct Cli {
    /// Path to the daemon's Unix socket
    #[arg(short, long, default_value = mrt_api::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a forwarding rule
    Add {
        /// Source IP address (0.0.0.0 matches any source)
        #[arg(long, default_value = "0.0.0.0")]
        source: String,

        /// Multicast group IP address
        #[arg(long)]
        group: String,

        /// Incoming interface name
        #[arg(long)]
        iif: String,

        /// Outgoing interface names (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        oifs: Vec<String>,
    },

    /// Delete a forwarding rule
    Del {
        /// Source IP address (0.0.0.0 matches any source)
        #[arg(long, default_value = "0.0.0.0")]
        source: String,

        /// Multicast group IP address
        #[arg(long)]
        group: String,
    },

    /// Show the VIF table and installed rules
    Show {
        /// Output raw JSON instead of formatted tables
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct VifRow {
    #[tabled(rename = "VIF")]
    slot: u16,
    #[tabled(rename = "Interface")]
    name: String,
    #[tabled(rename = "Index")]
    ifindex: u32,
    #[tabled(rename = "Refs")]
    ref_count: u32,
}

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "IIF")]
    iif: String,
    #[tabled(rename = "OIFs")]
    oifs: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (request, as_json) = match cli.command {
        Commands::Add {
            source,
            group,
            iif,
            oifs,
        } => (
            Request::InstallRule {
                source,
                group,
                iif,
                oifs,
            },
            true,
        ),
        Commands::Del { source, group } => (Request::RemoveRule { source, group }, true),
        Commands::Show { json } => (Request::ListState, json),
    };

    let response = send(&cli.socket, &request).await?;
    match response {
        Response::Ok { state } => {
            if let Some(state) = state {
                if as_json {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                } else {
                    print_state(&state);
                }
            } else {
                println!("ok");
            }
            Ok(())
        }
        Response::Error { kind, message } => {
            bail!("{}: {message}", kind.as_str());
        }
    }
}

async fn send(socket: &PathBuf, request: &Request) -> anyhow::Result<Response> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::ConnectionRefused
            || e.kind() == std::io::ErrorKind::NotFound
        {
            anyhow::anyhow!(
                "cannot connect to mrtd at {}: is the daemon running?",
                socket.display()
            )
        } else {
            anyhow::Error::from(e).context(format!("connecting to {}", socket.display()))
        }
    })?;

    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;

    let mut reply = String::new();
    BufReader::new(reader)
        .read_line(&mut reply)
        .await
        .context("reading response")?;
    if reply.is_empty() {
        bail!("daemon closed the connection without a response");
    }
    serde_json::from_str(&reply).context("decoding response")
}

fn print_state(state: &StateView) {
    println!("Virtual Interface Table (VIFs)");
    if state.vifs.is_empty() {
        println!("  No VIFs configured.");
    } else {
        let rows: Vec<VifRow> = state
            .vifs
            .iter()
            .map(|v| VifRow {
                slot: v.slot,
                name: v.name.clone(),
                ifindex: v.ifindex,
                ref_count: v.ref_count,
            })
            .collect();
        println!("{}", Table::new(rows));
    }

    println!("\nMulticast Forwarding Rules");
    if state.rules.is_empty() {
        println!("  No rules installed.");
    } else {
        let rows: Vec<RuleRow> = state
            .rules
            .iter()
            .map(|r| RuleRow {
                source: r.source.clone(),
                group: r.group.clone(),
                iif: r.iif.clone(),
                oifs: r.oifs.join(", "),
            })
            .collect();
        println!("{}", Table::new(rows));
    }

    if !state.orphans.is_empty() {
        println!("\nOrphaned VIFs (kernel removal pending retry)");
        let rows: Vec<VifRow> = state
            .orphans
            .iter()
            .map(|v| VifRow {
                slot: v.slot,
                name: v.name.clone(),
                ifindex: v.ifindex,
                ref_count: v.ref_count,
            })
            .collect();
        println!("{}", Table::new(rows));
    }
}
