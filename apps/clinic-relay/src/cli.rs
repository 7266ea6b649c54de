use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "clinic-relay")]
#[command(about = "Clinic registration rendezvous server")]
pub struct Cli {
    /// Listen port (overrides CLINIC_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Redis connection URL (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,
}
