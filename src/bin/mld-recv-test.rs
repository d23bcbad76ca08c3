
use mcastd::icmp6::mld::{MLDV2_ALL_ROUTERS, MLD_ALL_ROUTERS};
use mcastd::icmp6::socket::RawIcmp6Socket;
use mcastd::icmp6::Icmp6Packet;
use mcastd::interface::{self, InterfaceId};

fn main() -> std::io::Result<()> {
    env_logger::init();
    let socket = RawIcmp6Socket::new()?;
    socket.set_recv_hoplimit(true)?;
    socket.set_recv_hopopts(true)?;
    socket.set_recv_pktinfo(true)?;
    socket.join_multicast(MLDV2_ALL_ROUTERS, InterfaceId::UNSPECIFIED)?;
    socket.join_multicast(MLD_ALL_ROUTERS, InterfaceId::UNSPECIFIED)?;
    if let Err(e) = socket.set_mrt_flag(true) {
        log::warn!("MRT6_INIT failed, only queries and reports to joined groups are shown: {}", e);
    }
    let mut parser = mcastd::icmp6::Icmp6Parser::new();
    loop {
        socket.recv_parser(&mut parser)?;
        {
            let packet = parser.packet();
            let src = packet.target_addr;
            let (ifname, dst) = match packet.info.as_ref() {
                Some(info) => (interface::index_to_name(info.if_index)?, info.addr.to_string()),
                None => ("?".to_string(), "?".to_string()),
            };
            let ttl = packet.hop_limit.map(|h| h.hop_limit.to_string()).unwrap_or_else(|| "?".to_string());
            print!("[{}] {} -> {} (ttl: {})", ifname, src, dst, ttl);
        }

        match parser.parse() {
            Ok(Icmp6Packet::MulticastListenerQuery(mlq)) => {
                print!(" {:?} (max delay {:?})", mlq, mcastd::icmp6::mld::decode_max_response_code(mlq.maximum_response_delay));
            }
            Ok(Icmp6Packet::Unknown(icmp6_type, code)) => {
                print!(" ICMPv6 type {} code {}", icmp6_type, code);
            }
            Ok(parsed) => {
                print!(" {:?}", parsed);
            }
            Err(e) => {
                print!(" ICMPv6 <err: {}>", e);
            }
        }
        println!();
    }
}
