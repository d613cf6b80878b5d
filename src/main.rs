use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use dewmail::envelope::Relay;
use dewmail::http::ReqwestTransport;
use dewmail::message::Message;
use dewmail::smtp::SmtpServer;
use dewmail::{health, logging, Config};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let matches = Command::new("dewmail")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Turns inbound email into JSON webhook calls")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/dewmail.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Parse an .eml file and print the webhook call it would make")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("smtp")
                .long("smtp")
                .value_name("ADDR")
                .help("SMTP listen address, e.g. :25 or 127.0.0.1:2525")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        match Config::default().to_file(generate_path) {
            Ok(()) => println!("Default configuration written to: {generate_path}"),
            Err(e) => {
                eprintln!("Error generating configuration: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run(&matches).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/dewmail.yaml");
    let config_found = Path::new(config_path).exists();
    let mut config = if config_found {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    logging::init(matches.get_flag("verbose"), config.logging.log_dir.as_deref())?;
    if !config_found {
        warn!("Configuration file {} not found, using defaults", config_path);
    }

    if let Some(addr) = matches.get_one::<String>("smtp") {
        config.server.smtp_addr = parse_listen_addr(addr)?;
    }
    config.validate().context("Invalid configuration")?;
    if config.datastore.count_url.is_empty() {
        warn!("datastore.count_url is not set, every delivery will be logged as uncounted");
    }

    if matches.get_flag("test-config") {
        print_config_summary(&config);
        return Ok(());
    }

    let config = Arc::new(config);
    let transport = Arc::new(ReqwestTransport::new(&config.http)?);
    let relay = Arc::new(Relay::new(config.clone(), transport));

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        return test_email_file(&relay, email_file).await;
    }

    let smtp_listener = TcpListener::bind(config.server.smtp_addr)
        .await
        .with_context(|| format!("Failed to bind SMTP listener on {}", config.server.smtp_addr))?;
    let health_listener = TcpListener::bind(config.server.health_addr)
        .await
        .with_context(|| format!("Failed to bind health listener on {}", config.server.health_addr))?;

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            // Hold exit_tx open
            futures::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        let _ = exit_tx.send(true);
    });

    let server = Arc::new(SmtpServer::new(&config.server, Arc::new(relay)));
    info!("dewmail {} starting", env!("CARGO_PKG_VERSION"));
    tokio::try_join!(
        server.run(smtp_listener, exit_rx.clone()),
        health::serve(health_listener, exit_rx),
    )?;

    info!("dewmail stopped");
    Ok(())
}

/// Accepts `:25` as shorthand for all interfaces
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("Invalid listen address: {addr}"))
}

fn print_config_summary(config: &Config) {
    println!("Configuration is valid");
    println!("SMTP address: {}", config.server.smtp_addr);
    println!("Health address: {}", config.server.health_addr);
    println!("Webhook scheme: {}", config.scheme());
    println!("API route: {}", config.routing.api_route);
    if config.routing.domain_checking {
        println!("Accepted domains: {}", config.routing.valid_domains.join(", "));
    } else {
        println!("Accepted domains: any");
    }
    println!(
        "SPF: {}",
        match (config.spf.enabled, config.spf.require_pass) {
            (false, _) => "off",
            (true, false) => "recorded",
            (true, true) => "pass required",
        }
    );
    if config.datastore.count_url.is_empty() {
        println!("Delivery counter: not configured (deliveries are reported uncounted)");
    } else {
        println!(
            "Delivery counter: {} (max {} attempts)",
            config.datastore.count_url, config.datastore.max_retries
        );
    }
}

async fn test_email_file(relay: &Relay, email_file: &str) -> anyhow::Result<()> {
    let raw = std::fs::read(email_file)
        .with_context(|| format!("Failed to read email file {email_file}"))?;

    let mut message = Message::new("");
    relay
        .parser()
        .parse(&raw, &mut message)
        .await
        .context("Message would be dropped")?;
    let action = relay.dispatcher().action_for(&message)?;

    println!("POST {}", action.url());
    println!("{}", String::from_utf8_lossy(action.body()));
    Ok(())
}
