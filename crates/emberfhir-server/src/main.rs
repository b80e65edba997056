use clap::Parser;
use emberfhir_server::{Args, EmberServer, ServerError, build_config, init_tracing};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Help and version are normal exits; anything else is an
            // invalid configuration.
            if err.use_stderr() {
                eprintln!("{err}");
                std::process::exit(1);
            }
            print!("{err}");
            std::process::exit(0);
        }
    };

    let config = match build_config(args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("invalid configuration: {message}");
            std::process::exit(1);
        }
    };

    match EmberServer::new(config).run().await {
        Ok(()) => {}
        Err(err @ ServerError::Bind { .. }) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
