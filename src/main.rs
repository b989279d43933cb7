// src/main.rs

use pipewright::{cli, exit_code, logging, run};

#[tokio::main]
async fn main() {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("pipewright error: {err:?}");
        std::process::exit(exit_code::INTERNAL);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pipewright error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
