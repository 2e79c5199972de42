//! Per-host streaming agent binary.

fn main() -> Result<(), ezstream_agent::cli::Failure> {
    ezstream_agent::run()
}
