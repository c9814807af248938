mod bench;

use tracing::error;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediagrid=info".parse().unwrap()),
        )
        .init();

    let args = match bench::maybe_parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            eprintln!(
                "usage: mediagrid --benchmark <directory> [--runs N] [--width PX] \
                 [--viewport-height PX] [--scroll-step PX] [--frames-per-step N] \
                 [--zoom compact|comfortable|large]"
            );
            std::process::exit(2);
        }
        Err(err) => {
            error!("{err:#}");
            std::process::exit(2);
        }
    };

    let code = match bench::run_benchmark(args) {
        Ok(code) => code,
        Err(err) => {
            error!("Benchmark failed: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
