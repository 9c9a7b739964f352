//! Gridee CLI - manage the Gridee parking session from a terminal.
//!
//! Logs in against the Gridee backend, keeps the issued token in the
//! configured store and reports on the current session.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use gridee_core::api::{ApiClient, ApiError, Registration};
use gridee_core::auth::ExpirySource;
use gridee_core::{Config, SessionManager};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shortest password the backend accepts
const MIN_PASSWORD_LENGTH: usize = 6;

const USAGE: &str = "\
Usage: gridee <command>

Commands:
  login [email|phone]   Log in and store the session
  register              Create an account and log in
  logout                Forget the stored session
  status                Show whether a valid session is stored
  token                 Print the Authorization header value
  whoami                Ask the server who the session belongs to
";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<ApiError>() {
                Some(api_error) => eprintln!("Error: {}", api_error.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<ExitCode> {
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(ExitCode::from(2));
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };

    let store = config.open_store().context("Failed to open session store")?;
    let session = Arc::new(SessionManager::new(store));
    let api = ApiClient::new(&config.api_base_url(), session.clone())?;

    match command.as_str() {
        "login" => login(&api, &mut config, args.get(1).map(String::as_str)).await?,
        "register" => register(&api, &mut config).await?,
        "logout" => {
            api.logout()?;
            println!("Logged out.");
        }
        "status" => status(&session)?,
        "token" => match session.bearer_header_value()? {
            Some(bearer) => println!("{}", bearer),
            None => {
                eprintln!("Not logged in.");
                return Ok(ExitCode::FAILURE);
            }
        },
        "whoami" => {
            if !session.is_authenticated_or_logged_out() {
                eprintln!("Not logged in. Run `gridee login` first.");
                return Ok(ExitCode::FAILURE);
            }
            let user = api.current_user().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        "help" | "--help" | "-h" => print!("{}", USAGE),
        other => {
            eprintln!("Unknown command: {}\n", other);
            eprint!("{}", USAGE);
            return Ok(ExitCode::from(2));
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn login(api: &ApiClient, config: &mut Config, identifier: Option<&str>) -> Result<()> {
    let identifier = match identifier {
        Some(id) => id.to_string(),
        None => match config.last_identifier.clone() {
            Some(last) => {
                let input = prompt(&format!("Email or phone [{}]: ", last))?;
                if input.is_empty() {
                    last
                } else {
                    input
                }
            }
            None => prompt("Email or phone: ")?,
        },
    };
    let password = rpassword::prompt_password("Password: ")?;
    validate_credentials(&identifier, &password)?;

    println!("Authenticating...");
    let auth = api.login(&identifier, &password).await?;

    config.last_identifier = Some(ApiClient::normalize_identifier(&identifier));
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    info!("Login successful");
    println!("Logged in as {} ({}).", auth.display_name, auth.role);
    Ok(())
}

async fn register(api: &ApiClient, config: &mut Config) -> Result<()> {
    let name = prompt("Name: ")?;
    let email = prompt("Email: ")?;
    let phone = prompt("Phone: ")?;
    let parking_lot = prompt("Parking lot (optional): ")?;
    let password = rpassword::prompt_password("Password: ")?;
    validate_credentials(&email, &password)?;
    if name.is_empty() {
        anyhow::bail!("Name is required");
    }

    let registration = Registration {
        name,
        email: ApiClient::normalize_identifier(&email),
        phone,
        password,
        parking_lot_name: (!parking_lot.is_empty()).then_some(parking_lot),
        vehicle_numbers: Vec::new(),
    };
    let auth = api.register(&registration).await?;

    config.last_identifier = Some(registration.email.clone());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Registered and logged in as {}.", auth.display_name);
    Ok(())
}

fn status(session: &SessionManager) -> Result<()> {
    let status = session.status()?;
    if !status.authenticated {
        println!("Not logged in.");
        return Ok(());
    }

    println!("Logged in");
    println!("  User:  {}", status.display_name.unwrap_or_default());
    println!("  Id:    {}", status.subject_id.unwrap_or_default());
    println!("  Role:  {}", status.role.unwrap_or_default());
    if let Some(expires_at) = status.expires_at {
        let source = match status.expiry_source {
            Some(ExpirySource::Claim) => "token exp claim",
            _ => "24h since login",
        };
        println!(
            "  Expires: {} ({})",
            expires_at.with_timezone(&Local).format("%b %d, %Y %H:%M"),
            source
        );
    }
    Ok(())
}

fn validate_credentials(identifier: &str, password: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        anyhow::bail!("Email or phone is required");
    }
    if password.is_empty() {
        anyhow::bail!("Password is required");
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        anyhow::bail!("Password must be at least {} characters", MIN_PASSWORD_LENGTH);
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
