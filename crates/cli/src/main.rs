use clap::Parser;
use rtsp::{Server, ServerConfig};
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

/// `--source name=cam,sdp=cam.sdp,port=5000[,force-tcp][,disable-qos]`
#[derive(Debug, Clone)]
struct SourceArg {
    name: String,
    sdp: PathBuf,
    port: Option<u16>,
    force_tcp: bool,
    disable_qos: bool,
}

fn parse_source(value: &str) -> Result<SourceArg, String> {
    let mut name = None;
    let mut sdp = None;
    let mut port = None;
    let mut force_tcp = false;
    let mut disable_qos = false;

    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some(("name", v)) => name = Some(v.to_string()),
            Some(("sdp", v)) => sdp = Some(PathBuf::from(v)),
            Some(("port", v)) => {
                port = Some(v.parse().map_err(|_| format!("invalid port: {v}"))?)
            }
            None if part == "force-tcp" => force_tcp = true,
            None if part == "disable-qos" => disable_qos = true,
            _ => return Err(format!("unknown source option: {part}")),
        }
    }

    Ok(SourceArg {
        name: name.ok_or("source needs name=")?,
        sdp: sdp.ok_or("source needs sdp=")?,
        port,
        force_tcp,
        disable_qos,
    })
}

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay server fanning RTP sources out to many clients"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Host advertised to clients instead of the local address
    #[arg(long)]
    public_host: Option<String>,

    /// Lowest UDP port for client legs
    #[arg(long, default_value_t = 10000)]
    udp_port_min: u16,

    /// Highest UDP port for client legs
    #[arg(long, default_value_t = 65534)]
    udp_port_max: u16,

    /// Address UDP ingest sockets bind to
    #[arg(long, default_value = "0.0.0.0")]
    ingest_addr: IpAddr,

    /// Source to publish: name=<id>,sdp=<file>[,port=<base>][,force-tcp][,disable-qos]
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<SourceArg>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = ServerConfig {
        public_host: args.public_host.clone(),
        udp_port_min: args.udp_port_min,
        udp_port_max: args.udp_port_max,
        ..ServerConfig::default()
    };
    let mut server = Server::with_config(&args.bind, config);

    for source in &args.sources {
        let sdp = match std::fs::read_to_string(&source.sdp) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("Failed to read {}: {}", source.sdp.display(), e);
                return;
            }
        };
        if let Err(e) = server.add_source(&source.name, &sdp, source.force_tcp, source.disable_qos)
        {
            eprintln!("Failed to add source {}: {}", source.name, e);
            return;
        }
        if let Some(port) = source.port
            && let Err(e) = server.ingest_udp(&source.name, args.ingest_addr, port)
        {
            eprintln!("Failed to ingest {} on port {}: {}", source.name, port, e);
            return;
        }
        tracing::info!(source = %source.name, port = ?source.port, "source configured");
    }

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("RTSP relay on {}, press Enter to stop", args.bind);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    server.stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_option_parsing() {
        let s = parse_source("name=cam,sdp=/tmp/cam.sdp,port=5000,force-tcp").unwrap();
        assert_eq!(s.name, "cam");
        assert_eq!(s.sdp, PathBuf::from("/tmp/cam.sdp"));
        assert_eq!(s.port, Some(5000));
        assert!(s.force_tcp);
        assert!(!s.disable_qos);

        assert!(parse_source("sdp=a.sdp").is_err());
        assert!(parse_source("name=a,sdp=a.sdp,port=x").is_err());
        assert!(parse_source("name=a,sdp=a.sdp,bogus").is_err());
    }
}
