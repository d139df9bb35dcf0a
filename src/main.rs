use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use peerchat::{Config, Dispatcher, Flow};

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    // Initialize logging
    if let Err(e) = peerchat::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        peerchat::logging::init_console_only(&config.logging.level);
    }

    info!("peerchat starting as '{}'", config.chat.name);

    let autostart = config.server.autostart;
    let (dispatcher, mut display) = Dispatcher::new(config);

    let printer = tokio::spawn(async move {
        while let Some(message) = display.recv().await {
            println!("{}", message.format_with_time());
        }
    });

    if autostart {
        match dispatcher.start_server(None).await {
            Ok(addr) => println!("*** Server listening on {addr}"),
            Err(e) => {
                error!("Autostart failed: {}", e);
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    }

    println!("*** Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if dispatcher.submit_local_input(&line).await == Flow::Quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    drop(dispatcher);
    let _ = printer.await;

    info!("peerchat stopped");
    ExitCode::SUCCESS
}
