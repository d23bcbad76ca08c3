
use mcastd::family::ProtocolVersion;
use mcastd::icmp6::mld::{MulticastListenerQuery, MLD_ALL_NODES};
use mcastd::icmp6::packet::PacketInfo;
use mcastd::icmp6::socket::RawIcmp6Socket;
use mcastd::icmp6::{Icmp6Packet, Icmp6Writer};
use mcastd::interface;
use mcastd::rtnl::RtnetlinkConnection;
use mcastd::rtnl::addr::V6AddressRequestScope;

use clap::Parser;

use std::net::Ipv6Addr;

/// Send MLD queries, for exercising listeners on a link
#[derive(Debug, Clone, Parser)]
#[clap(name = "mld-query", version, about)]
struct Cli {
    /// interface to query on
    interface: String,

    /// group for an address-specific query; a general query is sent when omitted
    group: Option<Ipv6Addr>,

    /// sources for a source-specific query
    #[clap(long, short)]
    source: Vec<Ipv6Addr>,

    /// send an MLDv1 query
    #[clap(long)]
    v1: bool,

    /// Maximum Response Code
    #[clap(long, default_value_t = 10000)]
    max_response_code: u16,

    /// repeat every N seconds
    #[clap(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let if_index = interface::name_to_index(&args.interface)?;
    let conn = RtnetlinkConnection::new().await?;
    let source = conn.address().get_v6(if_index, V6AddressRequestScope::LinkLocal).await?
        .first()
        .copied()
        .ok_or_else(|| std::io::Error::other(format!("no link-local address on {}", args.interface)))?;

    let socket = RawIcmp6Socket::new()?;
    socket.set_multicast_hops(1)?;
    socket.set_multicast_loop(false)?;

    let group = args.group.unwrap_or(Ipv6Addr::UNSPECIFIED);
    let query = MulticastListenerQuery {
        version: if args.v1 { ProtocolVersion::V1 } else { ProtocolVersion::V2 },
        maximum_response_delay: args.max_response_code,
        group_address: group,
        suppress_router_processing: false,
        qrv: 2,
        qqic: 125,
        source_addresses: if args.v1 { Vec::new() } else { args.source.clone() },
    };

    let mut writer = Icmp6Writer::new();
    writer.set_packet(&Icmp6Packet::MulticastListenerQuery(query.clone()))
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    writer.setup_mld();
    writer.set_destination(if group.is_unspecified() { MLD_ALL_NODES } else { group });
    writer.set_packet_info(Some(PacketInfo { addr: source, if_index }));
    writer.set_checksum(&source);

    loop {
        if let Err(e) = socket.send_writer(&writer) {
            eprintln!("Failed to send query: {}", e);
        } else {
            println!("Sent {:?} from {} on {}", query, source, args.interface);
        }

        match args.interval {
            Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
            None => return Ok(()),
        }
    }
}
