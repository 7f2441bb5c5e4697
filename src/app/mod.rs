use crate::config::Config;
use crate::identity::Termination;
use crate::session::Session;
use serde_json::Map;

/// Exit status once the device identity is gone.
pub const TERMINATION_EXIT_CODE: i32 = 1;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
    }

    let config = Config::load()?;
    let session = Session::new(config)?;

    let identity = match session.connect(Map::new()).await {
        Ok(identity) => identity,
        Err(err) => {
            if let Some(termination) = err.termination() {
                exit_terminated(termination);
            }
            return Err(err.into());
        }
    };
    tracing::info!(
        device_id = %identity.device_id,
        direct_url = session.direct_url().as_deref().unwrap_or("-"),
        "thinkdevice running"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, exiting");
            std::process::exit(0);
        }
        termination = session.wait_for_termination() => exit_terminated(termination),
    }
}

fn exit_terminated(termination: Termination) -> ! {
    match termination {
        Termination::AuthRevoked => {
            tracing::error!("device credential revoked, local identity deleted")
        }
        Termination::RemoteDelete => tracing::warn!("device deleted by platform"),
    }
    std::process::exit(TERMINATION_EXIT_CODE);
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
