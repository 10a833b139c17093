use canopen_master::{classify, CanOpenError, Conn, SdoClient, Transport};
use log::{error, warn};
use std::process::ExitCode;
use std::time::Duration;

const USAGE: &str = "usage: canopen-master <interface> [info <node-id>]";

fn dump(mut conn: Conn) -> Result<(), CanOpenError> {
    loop {
        let raw = conn.recv_frame()?;
        match classify(&raw) {
            Ok(frame) => println!("{frame}"),
            Err(e) => warn!("{:#010x}: {e}", raw.id),
        }
    }
}

fn info(conn: Conn, node_id: u8) -> Result<(), CanOpenError> {
    let mut client = SdoClient::new(conn, node_id)?;
    let identity = [(1, "vendor id"), (2, "product code"), (3, "revision")];
    for (subindex, label) in identity {
        let value = client.upload_expedited(0x1018, subindex)?;
        println!("{label:>12}: {value:#010x}");
    }
    client.into_inner().close();
    Ok(())
}

fn parse_node_id(arg: &str) -> Option<u8> {
    let node_id = match arg.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16).ok()?,
        None => arg.parse().ok()?,
    };
    (1..=0x7F).contains(&node_id).then_some(node_id)
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = match args.as_slice() {
        [interface] => Conn::new(interface).and_then(dump),
        [interface, command, node] if command == "info" => {
            let Some(node_id) = parse_node_id(node) else {
                eprintln!("invalid node id {node}\n{USAGE}");
                return ExitCode::FAILURE;
            };
            Conn::open(interface, Duration::from_secs(1)).and_then(|conn| info(conn, node_id))
        }
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
