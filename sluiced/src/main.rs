use clap::{App, Arg};
use sluice::config::GatewayConfig;
use sluice::detect::Detector;
use sluice::logging;
use sluice::net::reactor::Reactor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

pub fn main() {
    let matches = App::new("Sluice Gateway")
        .version("1.0")
        .about("Runs the protocol-agnostic IoT gateway.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file; defaults apply when omitted")
                .required(false),
        )
        .get_matches();

    let config = GatewayConfig::load_or_default(matches.value_of("CONFIG_FILE"));

    // Initialize logging
    let logger = logging::init();

    install_signal_handlers();

    let detector = Arc::new(Detector::new(config.detection.clone(), &logger));

    let mut reactor =
        Reactor::new(config, detector, &logger).expect("Error binding gateway sockets");

    logging::info!(logger, "starting gateway");

    if let Err(err) = reactor.run(&RUNNING) {
        logging::crit!(logger, "reactor failed"; "error" => %err);
        std::process::exit(1);
    }

    logging::info!(logger, "gateway stopped");
}
