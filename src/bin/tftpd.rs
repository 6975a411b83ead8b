use clap::{crate_version, App, Arg};
use log::*;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use tftpd::{request_shutdown, ServerConfig, TftpServer};

extern "C" fn handle_signal(_: nix::libc::c_int) {
    // only the flag store is allowed here
    request_shutdown();
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in &[
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGABRT,
    ] {
        unsafe {
            signal::sigaction(*sig, &action)?;
        }
    }
    Ok(())
}

fn main() {
    let arg_root = "SERVER_ROOT";
    let arg_iface = "INTERFACE";
    let arg_debug = "DEBUG";

    let matches = App::new("tftpd")
        .about("A sandboxed TFTP server (IETF RFC 1350 with option extensions)")
        .version(crate_version!())
        .arg(
            Arg::with_name(arg_root)
                .help("the directory to serve; requests cannot escape it")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name(arg_iface)
                .help("IPv4 address to listen on (0.0.0.0 for all interfaces)")
                .required(true)
                .index(2),
        )
        .arg(
            Arg::with_name(arg_debug)
                .help("pass 1 to enable verbose tracing")
                .index(3),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    if matches.value_of(arg_debug) == Some("1") {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();

    let interface = match Ipv4Addr::from_str(matches.value_of(arg_iface).unwrap()) {
        Ok(ip) => IpAddr::V4(ip),
        Err(_) => {
            eprintln!(
                "\"{}\" is not an IPv4 address",
                matches.value_of(arg_iface).unwrap()
            );
            process::exit(1);
        }
    };

    let root = PathBuf::from(matches.value_of(arg_root).unwrap());
    if let Err(e) = env::set_current_dir(&root) {
        eprintln!("cannot enter {}: {}", root.display(), e);
        process::exit(1);
    }

    if let Err(e) = install_signal_handlers() {
        eprintln!("cannot install signal handlers: {}", e);
        process::exit(1);
    }

    let cfg = ServerConfig {
        root: PathBuf::from("."),
        addr: interface,
        ..Default::default()
    };

    let mut server = match TftpServer::with_cfg(&cfg) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("cannot start server: {:?}", e);
            process::exit(1);
        }
    };

    match server.run() {
        Ok(_) => info!("server stopped"),
        Err(e) => {
            eprintln!("server failed: {:?}", e);
            process::exit(1);
        }
    }
}
