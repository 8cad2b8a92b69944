use localbus_cli::run_cli;

#[tokio::main]
async fn main() {
    // Run CLI and handle errors. Printed directly: logging may not be
    // initialized when argument handling fails.
    if let Err(e) = run_cli().await {
        eprintln!("error: {}", e);

        // Exit with appropriate code based on error type
        let exit_code = match e {
            localbus_cli::CliError::Configuration(_) => 1,
            localbus_cli::CliError::Bus(_) => 2,
            localbus_cli::CliError::CommandFailed { .. } => 3,
            localbus_cli::CliError::InvalidArgument { .. } => 4,
            localbus_cli::CliError::Io(_) => 5,
            localbus_cli::CliError::Demo(_) => 6,
        };

        std::process::exit(exit_code);
    }
}
