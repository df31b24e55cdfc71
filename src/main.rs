use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};
use log::{error, info};

use testwire::logging::system_log;
use testwire::server::virtual_server::{register_rule, VirtualServer, DEFAULT_PORT};

// Standalone virtualized web service. Starts an empty server with only the
// shutdown endpoint plus a /status probe; useful as a target for smoke tests
// and for exercising clients by hand.
fn main() {
    let args = load_command_line_args();

    let level = system_log::parse_level(args.get_one::<String>("log-level").map(|s| s.as_str()).unwrap_or("info"));
    if let Err(e) = system_log::init_logging(level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let port = *args.get_one::<u16>("port").unwrap_or(&DEFAULT_PORT);
    info!("Starting testwire {}...", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server = VirtualServer::new(port);

        let status_rule = register_rule(&server, "/status", "/status*", Box::new(|_, response| {
            response.set_text("ok");
            Ok(())
        }))
        .await;
        if let Err(e) = status_rule {
            error!("Failed to register status endpoint: {}", e);
            std::process::exit(1);
        }

        let addr = match server.start().await {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to start server: {}", e);
                std::process::exit(1);
            }
        };
        info!("GET http://{}/shutdown stops the server", addr);

        let server = Arc::new(server);
        let interrupt_target = Arc::clone(&server);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                interrupt_target.trigger_shutdown();
            }
        });

        server.join().await;
    });
}

fn load_command_line_args() -> ArgMatches {
    Command::new("testwire")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on, 0 for an ephemeral port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .help("Log level")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"]),
        )
        .get_matches()
}
