use chrono::Utc;
use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use mailpixel::aggregator::{EventAggregator, REPORT_PAGE_SIZE};
use mailpixel::classifier::OpenClassifier;
use mailpixel::config::Config;
use mailpixel::events::{delay_seconds, parse_sent};
use mailpixel::links;
use mailpixel::report;
use mailpixel::store::EventStore;
use mailpixel::suspicion::OpenAttempt;
use std::process;

const DEFAULT_CONFIG_PATH: &str = "/etc/mailpixel.yaml";

#[tokio::main]
async fn main() {
    let matches = Command::new("mailpixel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email open and click tracker with open authenticity checks")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("init-db")
                .long("init-db")
                .help("Create the event database and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .help("Print the open report to stdout and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("classify")
                .long("classify")
                .value_name("USER_AGENT")
                .help("Classify a single open for the given user agent and exit")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("link")
                .long("link")
                .value_name("BASE_URL")
                .help("Print pixel (and with --url, click) links for --from/--to")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("from")
                .long("from")
                .value_name("ADDRESS")
                .help("Sender address for --classify or --link")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .value_name("ADDRESS")
                .help("Recipient address for --classify or --link")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .value_name("SECONDS")
                .help("Seconds between send and open for --classify")
                .value_parser(clap::value_parser!(i64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("sent")
                .long("sent")
                .value_name("TIMESTAMP")
                .help("Send timestamp for --link, or for --classify without --delay")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("DESTINATION")
                .help("Destination URL for the click link printed by --link")
                .action(ArgAction::Set),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        match config.validate() {
            Ok(()) => {
                println!("Configuration OK");
                println!("  Database: {}", config.storage.database_path);
                println!("  Listen address: {}", config.server.listen_addr);
                println!("  Report time zone: {}", config.report.timezone);
                println!("  Click write mode: {:?}", config.storage.click_mode);
            }
            Err(e) => {
                eprintln!("Configuration validation failed: {e:#}");
                process::exit(1);
            }
        }
        return;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    let from = matches.get_one::<String>("from").map(String::as_str);
    let to = matches.get_one::<String>("to").map(String::as_str);
    let sent = matches.get_one::<String>("sent").map(String::as_str);

    if let Some(user_agent) = matches.get_one::<String>("classify") {
        let delay = matches
            .get_one::<i64>("delay")
            .copied()
            .unwrap_or_else(|| {
                let now = Utc::now();
                delay_seconds(parse_sent(sent, now), now)
            });
        classify_open(&config, from.unwrap_or(""), to.unwrap_or(""), delay, user_agent);
        return;
    }

    if let Some(base) = matches.get_one::<String>("link") {
        let (Some(from), Some(to)) = (from, to) else {
            eprintln!("--link requires --from and --to");
            process::exit(1);
        };
        let destination = matches.get_one::<String>("url").map(String::as_str);
        print_links(&config, base, from, to, sent, destination);
        return;
    }

    if matches.get_flag("init-db") {
        let store = EventStore::new(&config.storage.database_path);
        match store.init() {
            Ok(()) => println!("Event database ready: {}", store.path().display()),
            Err(e) => {
                eprintln!("Failed to initialize database: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("report") {
        print_report(&config);
        return;
    }

    log::info!("Starting mailpixel {}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = mailpixel::serve(config).await {
        log::error!("Server error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let mut config = if std::path::Path::new(path).exists() {
        Config::from_file(path)?
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn classify_open(config: &Config, from: &str, to: &str, delay: i64, user_agent: &str) {
    let classifier = match OpenClassifier::from_config(&config.heuristics) {
        Ok(classifier) => classifier,
        Err(e) => {
            eprintln!("Error building classifier: {e:#}");
            process::exit(1);
        }
    };

    let classification = classifier.classify(&OpenAttempt::new(from, to, delay, Some(user_agent)));
    println!("User agent: {user_agent}");
    println!("Delay: {delay}s");
    for (condition, triggered) in classification.verdict.iter() {
        println!("  {:<24} {}", condition.name(), if triggered { "yes" } else { "no" });
    }
    println!("Result: {}", classification.label);
}

fn print_links(
    config: &Config,
    base: &str,
    from: &str,
    to: &str,
    sent: Option<&str>,
    destination: Option<&str>,
) {
    match links::pixel_url(base, from, to, sent) {
        Ok(url) => println!("Pixel: {url}"),
        Err(e) => {
            eprintln!("Error building pixel link: {e:#}");
            process::exit(1);
        }
    }
    if let Some(destination) = destination {
        match links::click_url(base, from, to, destination, &config.token.secret) {
            Ok(url) => println!("Click: {url}"),
            Err(e) => {
                eprintln!("Error building click link: {e:#}");
                process::exit(1);
            }
        }
    }
}

fn print_report(config: &Config) {
    let result = (|| -> anyhow::Result<String> {
        let classifier = OpenClassifier::from_config(&config.heuristics)?;
        let timezone = config.report_timezone()?;
        let store = EventStore::new(&config.storage.database_path);
        let groups = store.grouped_opens(REPORT_PAGE_SIZE)?;
        let rows = EventAggregator::new(&classifier).report(&groups);
        Ok(report::open_report_text(&rows, timezone))
    })();

    match result {
        Ok(text) => print!("{text}"),
        Err(e) => {
            eprintln!("Error building report: {e:#}");
            process::exit(1);
        }
    }
}
