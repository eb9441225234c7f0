//! `gtmctl`: a CLI companion to `gtmd`, issuing one request per invocation
//! over the wire protocol and rendering the reply (C12).

use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Cell, Table as ComfyTable};
use gtmcore::registry::IsolationLevel;
use gtmcore::Gxid;
use std::process::ExitCode;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "gtmctl")]
#[command(about = "Command-line client for a gtmd Global Transaction Manager")]
struct Args {
    /// gtmd address, host:port
    #[arg(short = 'H', long, default_value = "127.0.0.1:6666")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Begin a transaction and get a GXID (TXN_BEGIN_GETGXID)
    Begin {
        #[arg(long, value_enum, default_value = "repeatable-read")]
        isolation: Isolation,
        #[arg(long)]
        read_only: bool,
        #[arg(long, default_value = "")]
        session: String,
    },
    /// Commit a transaction by GXID (TXN_COMMIT)
    Commit { gxid: u32 },
    /// Roll back a transaction by GXID (TXN_ROLLBACK)
    Rollback { gxid: u32 },
    /// Report the next GXID to be assigned (TXN_GET_NEXT_GXID)
    GetNextGxid,
    /// List every open transaction's GXID (TXN_GXID_LIST)
    GxidList,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<Isolation> for IsolationLevel {
    fn from(v: Isolation) -> Self {
        match v {
            Isolation::ReadCommitted => IsolationLevel::ReadCommitted,
            Isolation::RepeatableRead => IsolationLevel::RepeatableRead,
            Isolation::Serializable => IsolationLevel::Serializable,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gtmctl: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    use gtmcore::protocol::{read_response, write_request, Request, Response};

    let mut stream = TcpStream::connect(&args.addr).await?;

    let request = match &args.command {
        Command::Begin { isolation, read_only, session } => Request::BeginGetgxid {
            isolation: (*isolation).into(),
            read_only: *read_only,
            session_id: session.clone(),
        },
        Command::Commit { gxid } => Request::Commit { gxid: Gxid::new(*gxid), waited: Vec::new() },
        Command::Rollback { gxid } => Request::Rollback { gxid: Gxid::new(*gxid) },
        Command::GetNextGxid => Request::GetNextGxid,
        Command::GxidList => Request::GxidList,
    };

    write_request(&mut stream, None, &request).await?;
    let response = read_response(&mut stream).await?;

    match response {
        Response::Gxid { gxid, timestamp } => println!("gxid={gxid} timestamp={timestamp}"),
        Response::GxidStatus { gxid, status } => println!("gxid={gxid} status={status}"),
        Response::NextGxid { gxid } => println!("next_gxid={gxid}"),
        Response::GxidList { gxids } => print_gxid_list(&gxids),
        Response::Error { code, message } => {
            return Err(format!("server error {code}: {message}").into());
        }
        other => println!("{other:?}"),
    }

    Ok(())
}

fn print_gxid_list(gxids: &[Gxid]) {
    let mut table = ComfyTable::new();
    table.load_preset(UTF8_FULL).set_header(vec![Cell::new("GXID")]);
    for gxid in gxids {
        table.add_row(vec![Cell::new(gxid.to_string())]);
    }
    println!("{table}");
}
