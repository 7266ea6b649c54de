use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use clinic_desk::api::{HttpApi, RegistryApi};
use clinic_desk::binder::SessionBinder;
use clinic_desk::channel::RoomChannel;
use clinic_desk::flow::{FlowState, RegistrationFlow, SessionContext};
use clinic_desk::store::TokenStore;
use clinic_proto::{parse_register_url, RegistrationData, ServerEvent};

#[derive(Parser)]
#[command(name = "clinic-desk", about = "Clinic registration desk client")]
struct Cli {
    /// Relay base URL
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a staff display: claim the device, show the registration link
    /// and keep it fresh as patients consume tokens.
    Display {
        #[arg(long)]
        device_id: String,
        #[arg(long)]
        doctor_id: String,
        /// Origin used in the patient-facing link
        #[arg(long, default_value = "http://localhost:5173")]
        origin: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Submit a patient registration from a scanned link.
    Register {
        /// The full registration URL from the QR code
        link: String,
        #[arg(long)]
        name: String,
        /// Date of birth, YYYY-MM-DD
        #[arg(long)]
        dob: String,
        #[arg(long)]
        sex: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        contact_number: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        allergies: Option<String>,
        #[arg(long)]
        current_medical_illness: Option<String>,
        #[arg(long)]
        symptoms: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Display {
            device_id,
            doctor_id,
            origin,
            notes,
        } => run_display(&cli.server, &device_id, &doctor_id, &origin, notes).await,
        Commands::Register {
            link,
            name,
            dob,
            sex,
            address,
            contact_number,
            email,
            allergies,
            current_medical_illness,
            symptoms,
        } => {
            let data = build_registration(
                name,
                &dob,
                sex,
                address,
                contact_number,
                email,
                allergies,
                current_medical_illness,
                symptoms,
            )?;
            run_register(&cli.server, &link, data).await
        }
    }
}

async fn run_display(
    server: &str,
    device_id: &str,
    doctor_id: &str,
    origin: &str,
    notes: Option<String>,
) -> Result<()> {
    let api = HttpApi::new(server);
    let mut binder = SessionBinder::new(api, origin, device_id, doctor_id);
    binder
        .open_session(notes)
        .await
        .context("failed to open session")?;

    let mut channel = RoomChannel::connect(server)
        .await
        .context("failed to connect realtime channel")?;
    let room_id = binder
        .join_display_room(&mut channel)
        .await
        .context("failed to join screen room")?;
    info!(room = %room_id, "screen room confirmed");

    let mut store = TokenStore::new();
    store.seed(binder.acquire_token().await?);

    if let Some(url) = binder.register_url(store.token(), Some(&room_id)) {
        println!("registration link: {url}");
    }

    loop {
        tokio::select! {
            event = channel.next_event() => {
                let Some(event) = event else {
                    warn!("realtime channel closed, ending session");
                    break;
                };
                if store.apply_event(&event, channel.current_room().as_deref()) {
                    if let Some(url) = binder.register_url(store.token(), Some(&room_id)) {
                        println!("registration link: {url}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    channel.close().await;
    if let Err(err) = binder.close_session().await {
        warn!("failed to close session cleanly: {err}");
    }
    Ok(())
}

async fn run_register(server: &str, link: &str, data: RegistrationData) -> Result<()> {
    let params = parse_register_url(link);
    let mut context = SessionContext::from_params(&params);

    let api = HttpApi::new(server);
    let mut flow = RegistrationFlow::load(api, &params).await?;

    // Join the display's room first so the consume is trusted there.
    let channel = match flow.state() {
        FlowState::Form {
            room_id: Some(room_id),
            ..
        } => match RoomChannel::connect(server).await {
            Ok(channel) => {
                channel.join_room(room_id);
                Some(channel)
            }
            Err(err) => {
                warn!("realtime channel unavailable, will consume over http: {err}");
                None
            }
        },
        _ => None,
    };

    match flow.state() {
        FlowState::InvalidLink => bail!("this registration link is invalid or expired"),
        FlowState::UpdateForm { .. } => {
            info!("link already used, updating the existing registration")
        }
        _ => {}
    }

    let registration = flow.submit(channel.as_ref(), data).await?;
    println!("registration submitted: {}", registration.id);

    // Drain briefly so a DEVICE_AVAILABLE broadcast can clear the context.
    if let Some(mut channel) = channel {
        let drain = tokio::time::sleep(std::time::Duration::from_millis(500));
        tokio::pin!(drain);
        loop {
            tokio::select! {
                event = channel.next_event() => {
                    match event {
                        Some(event) => {
                            if context.apply_event(&event) {
                                info!("device session ended");
                                break;
                            }
                            if matches!(event, ServerEvent::NewQr { .. }) {
                                // Successor token delivered to the display.
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut drain => break,
            }
        }
        channel.close().await;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_registration(
    name: String,
    dob: &str,
    sex: String,
    address: String,
    contact_number: String,
    email: Option<String>,
    allergies: Option<String>,
    current_medical_illness: Option<String>,
    symptoms: Option<String>,
) -> Result<RegistrationData> {
    let birth_date =
        NaiveDate::parse_from_str(dob, "%Y-%m-%d").context("dob must be YYYY-MM-DD")?;
    let age = (Utc::now().date_naive() - birth_date).num_days();
    if age < 0 {
        bail!("dob is in the future");
    }

    Ok(RegistrationData {
        name,
        age,
        dob: Some(dob.to_string()),
        sex,
        address,
        contact_number,
        email,
        allergies,
        current_medical_illness,
        symptoms,
    })
}
