use clap::Parser;
use image_publisher::cli::{Args, Runner};

#[tokio::main]
async fn main() {
    let args = Args::parse().from_env();

    let runner = Runner::new(args);

    match runner.run().await {
        Ok(report) => std::process::exit(report.exit_code),
        Err(e) => {
            runner.output().error(&e.to_string());
            if matches!(e, image_publisher::PublishError::Configuration(_)) {
                Args::print_examples();
            }
            std::process::exit(e.exit_code());
        }
    }
}
