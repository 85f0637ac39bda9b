#[macro_use]
mod cli;
pub mod core;
pub mod infrastructure;
pub mod resources;
pub mod statefile;

use std::process::ExitCode;

use clap::Parser;
use cli::display::{Message, MessageType};

// Entry point for the CLI application
fn main() -> ExitCode {
    // Handle all CLI setup that doesn't require async functionality
    if let Err(e) = cli::settings::setup_user_directory() {
        show_message!(
            MessageType::Error,
            Message {
                action: "Init".to_string(),
                details: format!(
                    "Failed to initialize ~/.chapply, please check your permissions: {e:?}"
                ),
            }
        );
        return ExitCode::from(1);
    }

    if let Err(e) = cli::settings::init_config_file() {
        show_message!(
            MessageType::Error,
            Message {
                action: "Init".to_string(),
                details: format!("Failed to write the default config file: {e:?}"),
            }
        );
        return ExitCode::from(1);
    }

    let settings = match cli::settings::read_settings() {
        Ok(settings) => settings,
        Err(e) => {
            show_message!(
                MessageType::Error,
                Message {
                    action: "Init".to_string(),
                    details: format!("Failed to read ~/.chapply/config.toml: {e}"),
                }
            );
            return ExitCode::from(1);
        }
    };

    let cli_result = match cli::Cli::try_parse() {
        Ok(cli_result) => cli_result,
        // Clap's default error format includes the --version and --help output
        Err(e) => e.exit(),
    };

    if cli_result.backtrace {
        // Safe: no other threads have started and no errors have been created yet.
        std::env::set_var("RUST_LIB_BACKTRACE", "1");
    }

    let logger_settings = settings.logger.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let result = runtime.block_on(async {
        cli::logger::setup_logging(&logger_settings);

        cli::top_command_handler(settings, &cli_result.command).await
    });

    match result {
        Ok(s) => {
            // Skip displaying empty messages (used for --json output where JSON is already printed)
            if !s.message.action.is_empty() || !s.message.details.is_empty() {
                show_message!(s.message_type, s.message);
            }
            ExitCode::from(0)
        }
        Err(e) => {
            if !e.message.action.is_empty() || !e.message.details.is_empty() {
                show_message!(e.message_type, e.message);
            }
            if let Some(err) = e.error {
                eprintln!("{err:?}");
            }
            ExitCode::from(1)
        }
    }
}
