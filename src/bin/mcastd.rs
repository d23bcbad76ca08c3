
use mcastd::backend::LinuxServices;
use mcastd::config::{Config, ConfigManager};
use mcastd::family::Mld;
use mcastd::icmp6::mld::decode_max_response_code;
use mcastd::icmp6::{Icmp6Packet, Icmp6Parser, RawIcmp6Socket};
use mcastd::interface::InterfaceStateManager;
use mcastd::membership::SocketId;
use mcastd::stack::MulticastStack;

use clap::{Parser, Subcommand};

use std::path::PathBuf;


fn main() {
    env_logger::init();
    let args = Cli::parse();

    if let Command::DecodeDelay { code } = args.subcmd {
        println!("{:?}", decode_max_response_code(code));
        return;
    }

    let config_manager = ConfigManager::new(&args.config);
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    rt.block_on(async move {
        if let Err(e) = config_manager.load().await {
            log::warn!("Failed to load configuration: {:?}", e);
        }

        let config = config_manager.clone();
        tokio::spawn(async move {
            while !config_manager.is_loaded() {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                let _ = config_manager.load().await;
            }

            log::info!("Configuration loaded");
        });

        // enable config reloader for daemon subcommands
        let config_reloader = config.clone();
        let enable_config_reloader = move || {
            tokio::spawn(async move {
                let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        log::error!("Failed to install SIGHUP handler: {}", e);
                        return;
                    }
                };
                loop {
                    signal.recv().await;
                    log::info!("Received SIGHUP, reloading configuration");
                    if let Err(e) = config_reloader.load().await {
                        log::warn!("Failed to reload configuration: {:?}", e);
                    }
                }
            });
        };

        match args.subcmd {
            Command::Start => {
                enable_config_reloader();
                if let Err(e) = start(config).await {
                    log::error!("Daemon failed: {}", e);
                    std::process::exit(1);
                }
            }

            #[allow(unreachable_patterns)]
            _ => {
                log::error!("Invalid subcommand");
            }
        }
    });
}

async fn start(config: ConfigManager) -> Result<(), std::io::Error> {
    if !config.is_loaded() {
        log::warn!("Configuration not loaded, waiting til configured");
        let _ = config.subscribe().recv().await;
    }
    let mut config_changes = config.subscribe();

    let mut config_data = config.get().ok_or_else(|| std::io::Error::other("configuration not loaded"))?;
    log::debug!("Configuration: {:?}", config_data);

    let if_manager = InterfaceStateManager::new().await?;

    let raw_socket = RawIcmp6Socket::new()?;
    raw_socket.setup_mld_listener()?;
    if let Err(e) = raw_socket.set_mrt_flag(true) {
        log::warn!("MRT6_INIT failed, reports from other listeners may be missed: {}", e);
    }
    let socket = raw_socket.into_async()?;

    let (mut services, mut timers) = LinuxServices::new(socket.clone(), if_manager).await?;

    let mut stack = MulticastStack::<Mld>::new(config_data.global.mld());
    let mut daemon_sockets = apply_config(&stack, &mut services, &config_data);

    let mut parser = Icmp6Parser::new();
    loop {
        tokio::select! {
            res = socket.recv_parser(&mut parser) => {
                match res {
                    Ok(()) => handle_packet(&stack, &mut services, &parser),
                    Err(e) => log::error!("Failed to receive packet: {}", e),
                }
            }

            Some(id) = timers.recv() => {
                services.timer_fired(&id);
                stack.timer_expired(&mut services, &id);
            }

            res = config_changes.recv() => {
                if res.is_err() {
                    continue;
                }
                let new_config = match config.get() {
                    Some(new_config) => new_config,
                    None => continue,
                };
                if new_config == config_data {
                    continue;
                }
                log::info!("Applying new configuration");
                shutdown(&stack, &mut services, &daemon_sockets);
                config_data = new_config;
                stack = MulticastStack::new(config_data.global.mld());
                daemon_sockets = apply_config(&stack, &mut services, &config_data);
            }

            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                shutdown(&stack, &mut services, &daemon_sockets);
                log::info!("Statistics: {:?}", stack.stats());
                return Ok(());
            }
        }
    }
}

/// Enables MLD on every configured interface and joins its static groups,
/// one daemon socket per interface.
fn apply_config(stack: &MulticastStack<Mld>, services: &mut LinuxServices, config: &Config) -> Vec<SocketId> {
    let mut sockets = Vec::new();
    for iface in config.interfaces.iter() {
        let if_id = match services.interfaces().get_index_by_name(&iface.name) {
            Some(if_id) => if_id,
            None => {
                log::warn!("Interface not found: {}", iface.name);
                continue;
            }
        };
        stack.add_interface(if_id);

        let socket = stack.register_socket();
        sockets.push(socket);
        for group in iface.groups.iter() {
            if let Err(e) = stack.process_multicast_listen(services, socket, if_id, group.address, group.mode, &group.sources) {
                log::error!("Failed to join {} on {}: {}", group.address, iface.name, e);
            }
        }
    }
    sockets
}

fn shutdown(stack: &MulticastStack<Mld>, services: &mut LinuxServices, sockets: &[SocketId]) {
    for socket in sockets {
        if let Err(e) = stack.close_socket(services, *socket) {
            log::warn!("Failed to close {}: {}", socket, e);
        }
    }
    for if_id in stack.interfaces() {
        if let Err(e) = stack.remove_interface(services, if_id) {
            log::warn!("Failed to disable MLD on {}: {}", if_id, e);
        }
    }
}

fn handle_packet(stack: &MulticastStack<Mld>, services: &mut LinuxServices, parser: &Icmp6Parser) {
    let packet = parser.packet();
    let info = match packet.info {
        Some(info) => info,
        None => {
            log::debug!("Received packet without pktinfo from {}", packet.target_addr);
            return;
        }
    };

    // hop limit and router alert are checked here, where the ancillary data is known
    match parser.parse() {
        Ok(Icmp6Packet::Unknown(..)) => return,
        Ok(_) => {}
        Err(e) => {
            log::debug!("{}: dropping MLD message from {}: {}", info.if_index, packet.target_addr, e);
            return;
        }
    }

    if let Err(e) = stack.input(services, info.if_index, &packet.target_addr, packet.data()) {
        log::debug!("{}: MLD input from {}: {}", info.if_index, packet.target_addr, e);
    }
}


/// Host-side MLD listener daemon
#[derive(Debug, Clone, Parser)]
#[clap(name = "mcastd", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short, long, default_value = "/etc/mcastd.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub subcmd: Command,
}

#[derive(Debug, Clone, Subcommand)]
#[non_exhaustive]
pub enum Command {
    /// start the daemon
    Start,

    /// print the delay an MLDv2 Maximum Response Code stands for
    DecodeDelay {
        code: u16,
    },
}
