use clap::{crate_version, App, Arg};
use log::LevelFilter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::str::FromStr;
use tftpd::client::{self, ClientConfig};
use tftpd::packet::TransferMode;

fn parse_ipv4(s: &str) -> IpAddr {
    match Ipv4Addr::from_str(s) {
        Ok(ip) => IpAddr::V4(ip),
        Err(_) => {
            eprintln!("\"{}\" is not an IPv4 address", s);
            process::exit(1);
        }
    }
}

fn main() {
    let arg_host = "host";
    let arg_iface = "interface";
    let arg_write = "write";
    let arg_type = "type";
    let arg_verbose = "verbose";
    let arg_files = "FILES";

    let matches = App::new("tftpc")
        .about("TFTP client for fetching and storing files")
        .version(crate_version!())
        .arg(
            Arg::with_name(arg_host)
                .long("host")
                .help("IPv4 address of the TFTP server")
                .takes_value(true)
                .required(true)
                .value_name("ADDRESS"),
        )
        .arg(
            Arg::with_name(arg_iface)
                .long("interface")
                .help("local IPv4 address to bind to")
                .takes_value(true)
                .value_name("ADDRESS"),
        )
        .arg(
            Arg::with_name(arg_write)
                .short("w")
                .long("write")
                .help("store the files on the server instead of fetching them"),
        )
        .arg(
            Arg::with_name(arg_type)
                .long("type")
                .help("transfer mode")
                .takes_value(true)
                .possible_values(&["octet", "netascii"])
                .default_value("octet"),
        )
        .arg(
            Arg::with_name(arg_verbose)
                .short("v")
                .long("verbose")
                .help("enable verbose tracing"),
        )
        .arg(
            Arg::with_name(arg_files)
                .help("files to transfer")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    if matches.is_present(arg_verbose) {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();

    let cfg = ClientConfig {
        server: SocketAddr::new(parse_ipv4(matches.value_of(arg_host).unwrap()), 69),
        interface: matches.value_of(arg_iface).map(parse_ipv4),
        mode: match matches.value_of(arg_type).unwrap() {
            "netascii" => TransferMode::Netascii,
            _ => TransferMode::Octet,
        },
    };
    let write = matches.is_present(arg_write);

    let mut failed = false;
    for file in matches.values_of(arg_files).unwrap() {
        let res = if write {
            client::put_file(&cfg, file)
        } else {
            client::get_file(&cfg, file)
        };
        match res {
            Ok(()) => println!("{}: ok", file),
            Err(e) => {
                eprintln!("{}: {:?}", file, e);
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}
